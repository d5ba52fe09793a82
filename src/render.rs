//! Render surfaces
//!
//! The pipeline never draws anything itself; verdicts and overlays are handed
//! to a [`RenderSurface`].

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::discovery::ImageHandle;
use crate::document::NodeId;
use crate::error::{DetectorError, Result};
use crate::saliency::SaliencyOverlay;
use crate::tensor::ClassificationScore;

pub trait RenderSurface: Send + Sync {
    fn apply_classification(&self, handle: &ImageHandle, score: &ClassificationScore);

    fn apply_overlay(&self, handle: &ImageHandle, overlay: &SaliencyOverlay);

    /// Remove everything previously applied for `handle`
    fn clear(&self, handle: &ImageHandle);
}

/// Logs verdicts and writes overlays as PNG files into an output directory
pub struct LoggingSurface {
    output_dir: Option<PathBuf>,
}

impl LoggingSurface {
    pub fn new(output_dir: Option<PathBuf>) -> Self {
        Self { output_dir }
    }

    /// `<output_dir>/<source stem>-<node>.saliency.png`
    pub fn overlay_path(&self, handle: &ImageHandle) -> Option<PathBuf> {
        let dir = self.output_dir.as_ref()?;
        let stem = Path::new(handle.source())
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("image");
        Some(dir.join(format!("{}-{}.saliency.png", stem, handle.node())))
    }

    fn write_overlay(path: &Path, overlay: &SaliencyOverlay) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DetectorError::Image(format!("{}: {}", parent.display(), e)))?;
        }
        overlay.image.save(path)?;
        Ok(())
    }
}

impl RenderSurface for LoggingSurface {
    fn apply_classification(&self, handle: &ImageHandle, score: &ClassificationScore) {
        info!(
            node = handle.node(),
            source = %handle.source(),
            probability = score.probability,
            is_ai = score.is_ai,
            "Image classified: {}",
            score
        );
    }

    fn apply_overlay(&self, handle: &ImageHandle, overlay: &SaliencyOverlay) {
        let Some(path) = self.overlay_path(handle) else {
            info!(node = handle.node(), fingerprint = %overlay.fingerprint, "Saliency overlay ready");
            return;
        };

        match Self::write_overlay(&path, overlay) {
            Ok(()) => info!(node = handle.node(), path = %path.display(), "📝 Saliency overlay written"),
            Err(e) => warn!(node = handle.node(), path = %path.display(), error = %e, "Failed to write overlay"),
        }
    }

    fn clear(&self, handle: &ImageHandle) {
        if let Some(path) = self.overlay_path(handle) {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove overlay");
                }
            }
        }
    }
}

/// Keeps the latest verdict and overlay per node in memory
#[derive(Default)]
pub struct MemorySurface {
    classifications: DashMap<NodeId, ClassificationScore>,
    overlays: DashMap<NodeId, Arc<SaliencyOverlay>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classification(&self, node: NodeId) -> Option<ClassificationScore> {
        self.classifications.get(&node).map(|entry| *entry.value())
    }

    pub fn overlay(&self, node: NodeId) -> Option<Arc<SaliencyOverlay>> {
        self.overlays.get(&node).map(|entry| Arc::clone(entry.value()))
    }

    pub fn classified_count(&self) -> usize {
        self.classifications.len()
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }
}

impl RenderSurface for MemorySurface {
    fn apply_classification(&self, handle: &ImageHandle, score: &ClassificationScore) {
        self.classifications.insert(handle.node(), *score);
    }

    fn apply_overlay(&self, handle: &ImageHandle, overlay: &SaliencyOverlay) {
        self.overlays.insert(handle.node(), Arc::new(overlay.clone()));
    }

    fn clear(&self, handle: &ImageHandle) {
        self.classifications.remove(&handle.node());
        self.overlays.remove(&handle.node());
    }
}
