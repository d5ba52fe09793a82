//! Saliency Engine
//!
//! Produces a translucent heatmap overlay explaining a positive
//! classification. Overlays are cached by a cheap content fingerprint, and
//! generation is limited to a few concurrent jobs.
//!
//! The attention grid comes from an [`AttentionSource`]. The bundled
//! [`SyntheticAttention`] is a placeholder: a center-weighted radial falloff
//! with a little noise on top. It does not look at model gradients and is not
//! Grad-CAM.

use image::{Rgba, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::bridge::InferenceBridge;
use crate::config::{SaliencyConfig, SALIENCY_INPUT_SIZE};
use crate::error::{DetectorError, Result};
use crate::jobs::JobSlots;
use crate::metrics;
use crate::tensor::{self, ClassificationScore, OutputInterpretation, Tensor};

/// Target number of sampled bytes per fingerprint
const FINGERPRINT_SAMPLES: usize = 100;

/// Upper bound of the uniform noise added to each attention cell
const ATTENTION_NOISE: f32 = 0.2;

// ============================================================================
// Fingerprint
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(i32);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// 32-bit rolling hash over a fixed-stride sample of the RGBA bytes, with
/// the dimensions folded in last. Not collision resistant.
pub fn fingerprint(pixels: &[u8], width: u32, height: u32) -> Fingerprint {
    let step = (pixels.len() / FINGERPRINT_SAMPLES).max(1);

    let mix = |hash: i32, value: i32| hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(value);

    let hash = pixels
        .iter()
        .step_by(step)
        .fold(0i32, |hash, byte| mix(hash, *byte as i32));
    let hash = mix(mix(hash, width as i32), height as i32);

    Fingerprint(hash)
}

// ============================================================================
// Cache
// ============================================================================

/// Bounded map evicting in insertion order. Re-inserting an existing key
/// replaces the value but keeps its original position.
pub struct SaliencyCache {
    capacity: usize,
    entries: HashMap<Fingerprint, Arc<SaliencyOverlay>>,
    order: VecDeque<Fingerprint>,
}

impl SaliencyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<Arc<SaliencyOverlay>> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: Fingerprint, overlay: Arc<SaliencyOverlay>) {
        if self.capacity == 0 {
            return;
        }
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = overlay;
            return;
        }

        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                debug!(fingerprint = %oldest, "Evicted saliency overlay");
            }
        }
        self.order.push_back(key);
        self.entries.insert(key, overlay);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ============================================================================
// Attention
// ============================================================================

/// Source of a `grid × grid` attention map, row-major, values in `[0, 1]`
pub trait AttentionSource: Send + Sync {
    /// `input` is the preprocessed saliency tensor, `signal` the model output for it
    fn attention(&self, input: &Tensor, signal: &Tensor, grid: usize) -> Vec<f32>;
}

/// Placeholder attention: radial falloff from the grid center plus noise
pub struct SyntheticAttention {
    rng: Mutex<StdRng>,
}

impl SyntheticAttention {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }
}

impl AttentionSource for SyntheticAttention {
    fn attention(&self, _input: &Tensor, _signal: &Tensor, grid: usize) -> Vec<f32> {
        let center = (grid / 2) as f32;
        // Falloff reaches zero ten cells out on a 14-cell grid
        let radius = grid as f32 * 10.0 / 14.0;
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        let mut cells = Vec::with_capacity(grid * grid);
        for y in 0..grid {
            for x in 0..grid {
                let dx = x as f32 - center;
                let dy = y as f32 - center;
                let dist = (dx * dx + dy * dy).sqrt();
                let falloff = (1.0 - dist / radius).max(0.0);
                cells.push(falloff + rng.random::<f32>() * ATTENTION_NOISE);
            }
        }

        normalize(&mut cells);
        cells
    }
}

/// Min-max normalize in place; a constant map becomes all zeros.
pub fn normalize(values: &mut [f32]) {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    if !range.is_finite() || range <= f32::EPSILON {
        values.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    values.iter_mut().for_each(|v| *v = (*v - min) / range);
}

// ============================================================================
// Upscale and colormap
// ============================================================================

/// Bilinear resize of a row-major `src_w × src_h` grid to `dst_w × dst_h`.
/// Sample positions use the ratio `src / dst` per axis; the far neighbor is
/// clamped to the last source row/column.
pub fn upscale_bilinear(grid: &[f32], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<f32> {
    if src_w == 0 || src_h == 0 || grid.len() < src_w * src_h {
        return vec![0.0; dst_w * dst_h];
    }

    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;
    let at = |x: usize, y: usize| grid[y * src_w + x];

    let mut out = Vec::with_capacity(dst_w * dst_h);
    for y in 0..dst_h {
        let src_y = y as f32 * y_ratio;
        let y0 = (src_y.floor() as usize).min(src_h - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = src_y - y0 as f32;

        for x in 0..dst_w {
            let src_x = x as f32 * x_ratio;
            let x0 = (src_x.floor() as usize).min(src_w - 1);
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = src_x - x0 as f32;

            let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
            let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
            out.push(top * (1.0 - fy) + bottom * fy);
        }
    }
    out
}

/// Blue → cyan → green → yellow → red over four equal bands, translucent
/// with a floor on opacity so cold regions stay visible.
pub fn colormap(value: f32) -> [u8; 4] {
    let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let channel = |x: f32| (x * 255.0).floor() as u8;

    let [r, g, b] = if v < 0.25 {
        [0, channel(v * 4.0), 255]
    } else if v < 0.5 {
        [0, 255, channel(1.0 - (v - 0.25) * 4.0)]
    } else if v < 0.75 {
        [channel((v - 0.5) * 4.0), 255, 0]
    } else {
        [255, channel(1.0 - (v - 0.75) * 4.0), 0]
    };
    let alpha = (v.max(0.3) * 255.0 * 0.7).floor() as u8;

    [r, g, b, alpha]
}

/// Color-map a `width × height` heatmap into an RGBA image
pub fn render_heatmap(heatmap: &[f32], width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        let value = heatmap
            .get(y as usize * width as usize + x as usize)
            .copied()
            .unwrap_or(0.0);
        Rgba(colormap(value))
    })
}

// ============================================================================
// Engine
// ============================================================================

/// Explanation for one image at its natural resolution
#[derive(Debug, Clone)]
pub struct SaliencyOverlay {
    pub fingerprint: Fingerprint,
    pub width: u32,
    pub height: u32,
    /// Upscaled attention, row-major, `width * height` values in `[0, 1]`
    pub heatmap: Vec<f32>,
    pub image: RgbaImage,
    /// Classifier verdict on the saliency input
    pub score: ClassificationScore,
}

pub struct SaliencyEngine {
    bridge: Arc<dyn InferenceBridge>,
    attention: Arc<dyn AttentionSource>,
    cache: Mutex<SaliencyCache>,
    slots: JobSlots,
    grid_size: usize,
    interpretation: OutputInterpretation,
}

impl SaliencyEngine {
    pub fn new(bridge: Arc<dyn InferenceBridge>, config: &SaliencyConfig) -> Self {
        info!(
            max_jobs = config.max_concurrent_jobs,
            cache_capacity = config.cache_capacity,
            "Saliency engine created"
        );
        Self {
            bridge,
            attention: Arc::new(SyntheticAttention::new(config.noise_seed)),
            cache: Mutex::new(SaliencyCache::new(config.cache_capacity)),
            slots: JobSlots::from_config(config),
            grid_size: config.grid_size.max(1),
            interpretation: OutputInterpretation::default(),
        }
    }

    pub fn with_attention(mut self, attention: Arc<dyn AttentionSource>) -> Self {
        self.attention = attention;
        self
    }

    pub fn with_interpretation(mut self, interpretation: OutputInterpretation) -> Self {
        self.interpretation = interpretation;
        self
    }

    fn cached(&self, key: &Fingerprint) -> Option<Arc<SaliencyOverlay>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
    }

    /// Overlay for an RGBA image; repeated calls for the same content are
    /// served from the cache.
    pub async fn generate(&self, pixels: &[u8], width: u32, height: u32) -> Result<Arc<SaliencyOverlay>> {
        if width == 0 || height == 0 || pixels.len() != width as usize * height as usize * 4 {
            return Err(DetectorError::InvalidInput(format!(
                "RGBA buffer of {} bytes does not match {}x{}",
                pixels.len(),
                width,
                height
            )));
        }

        let key = fingerprint(pixels, width, height);
        if let Some(hit) = self.cached(&key) {
            metrics::SALIENCY_CACHE_HITS.inc();
            debug!(fingerprint = %key, "Saliency cache hit");
            return Ok(hit);
        }
        metrics::SALIENCY_CACHE_MISSES.inc();

        let _permit = self.slots.acquire().await?;

        // A job for the same content may have finished while this one waited
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }

        debug!(fingerprint = %key, width, height, active = self.slots.active(), "Generating saliency map");
        let input = tensor::encode(pixels, width, height, SALIENCY_INPUT_SIZE)?;
        let signal = self.bridge.invoke(input.clone()).await?;
        let score = tensor::decode(signal.data(), self.interpretation)?;

        let grid = self.attention.attention(&input, &signal, self.grid_size);
        let heatmap = upscale_bilinear(
            &grid,
            self.grid_size,
            self.grid_size,
            width as usize,
            height as usize,
        );
        let image = render_heatmap(&heatmap, width, height);

        let overlay = Arc::new(SaliencyOverlay {
            fingerprint: key,
            width,
            height,
            heatmap,
            image,
            score,
        });
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&overlay));

        Ok(overlay)
    }

    pub fn active_jobs(&self) -> usize {
        self.slots.active()
    }

    pub fn cached_overlays(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_cached(&self, pixels: &[u8], width: u32, height: u32) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&fingerprint(pixels, width, height))
    }
}
