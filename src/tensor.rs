//! Tensor Codec
//!
//! Converts RGBA pixel buffers into the fixed-size `[1, H, W, 3]` input the
//! detector model expects, and turns raw model output back into a calibrated
//! AI probability.
//!
//! Input contract: channels are RGB (alpha dropped), each byte divided by 255,
//! written in row-major height-width-channel order.

use image::imageops::{self, FilterType};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::AI_THRESHOLD;
use crate::error::{DetectorError, Result};

/// Dense f32 buffer with an explicit shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DetectorError::InvalidInput(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Zero-filled image input, used to warm up an engine
    pub fn zeros_image(size: usize) -> Self {
        Self {
            shape: vec![1, size, size, 3],
            data: vec![0.0; size * size * 3],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check the `[1, H, W, 3]` image-input contract before it reaches an engine
    pub fn validate_image_input(&self) -> Result<()> {
        match self.shape.as_slice() {
            [1, h, w, 3] if *h > 0 && *w > 0 && self.data.len() == h * w * 3 => Ok(()),
            other => Err(DetectorError::InvalidInput(format!(
                "expected [1, H, W, 3] with {} elements, got {:?}",
                self.data.len(),
                other
            ))),
        }
    }
}

/// Resample an RGBA buffer to `target × target` and normalize it into a tensor.
pub fn encode(pixels: &[u8], src_w: u32, src_h: u32, target: u32) -> Result<Tensor> {
    if src_w == 0 || src_h == 0 || target == 0 {
        return Err(DetectorError::InvalidInput(format!(
            "zero dimension: {}x{} -> {}",
            src_w, src_h, target
        )));
    }

    let expected = src_w as usize * src_h as usize * 4;
    if pixels.len() != expected {
        return Err(DetectorError::InvalidInput(format!(
            "RGBA buffer for {}x{} needs {} bytes, got {}",
            src_w,
            src_h,
            expected,
            pixels.len()
        )));
    }

    let source = RgbaImage::from_raw(src_w, src_h, pixels.to_vec())
        .ok_or_else(|| DetectorError::InvalidInput("RGBA buffer rejected".into()))?;

    let resized = if src_w == target && src_h == target {
        source
    } else {
        imageops::resize(&source, target, target, FilterType::Triangle)
    };

    let side = target as usize;
    let mut data = Vec::with_capacity(side * side * 3);
    for pixel in resized.pixels() {
        let [r, g, b, _] = pixel.0;
        data.push(r as f32 / 255.0);
        data.push(g as f32 / 255.0);
        data.push(b as f32 / 255.0);
    }

    Tensor::new(vec![1, side, side, 3], data)
}

/// How a single-element model output is turned into a probability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputInterpretation {
    /// Values outside `[0, 1]` are treated as logits, values inside are
    /// assumed to be calibrated probabilities already. A logit that happens to
    /// land in `[0, 1]` is therefore misread; prefer an explicit mode when the
    /// model's output head is known.
    #[default]
    Auto,
    /// Always apply the logistic function
    Logit,
    /// Always use the value directly
    Probability,
}

impl FromStr for OutputInterpretation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "logit" => Ok(Self::Logit),
            "probability" | "prob" => Ok(Self::Probability),
            other => Err(format!("Unknown output interpretation: {}", other)),
        }
    }
}

/// Calibrated classifier verdict for one image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationScore {
    pub probability: f32,
    pub is_ai: bool,
}

impl ClassificationScore {
    pub fn from_probability(probability: f32) -> Self {
        let probability = probability.clamp(0.0, 1.0);
        Self {
            probability,
            is_ai: probability >= AI_THRESHOLD,
        }
    }
}

impl fmt::Display for ClassificationScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.is_ai { "AI" } else { "not AI" };
        write!(f, "{} ({:.1}%)", label, self.probability * 100.0)
    }
}

/// Numerically stable softmax (max subtracted before exponentiating)
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Interpret raw model output as an AI probability.
pub fn decode(output: &[f32], interpretation: OutputInterpretation) -> Result<ClassificationScore> {
    if output.iter().any(|v| !v.is_finite()) {
        return Err(DetectorError::InvalidInput(format!(
            "non-finite model output: {:?}",
            output
        )));
    }

    let probability = match output {
        // [p_real, p_ai]
        [a, b] => softmax(&[*a, *b])[1],
        [v] => match interpretation {
            OutputInterpretation::Logit => sigmoid(*v),
            OutputInterpretation::Probability => *v,
            OutputInterpretation::Auto => {
                if (0.0..=1.0).contains(v) {
                    *v
                } else {
                    sigmoid(*v)
                }
            }
        },
        other => {
            return Err(DetectorError::InvalidInput(format!(
                "expected 1 or 2 output values, got {}",
                other.len()
            )))
        }
    };

    Ok(ClassificationScore::from_probability(probability))
}
