pub mod bridge;
pub mod config;
pub mod detector;
pub mod discovery;
pub mod document;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod onnx;
pub mod render;
pub mod retry;
pub mod saliency;
pub mod scheduler;
pub mod settings;
pub mod tensor;

// Re-export commonly used types for easier testing
pub use crate::bridge::{build_bridge, DirectBridge, InferenceBridge, InferenceEngine, IsolatedBridge};
pub use crate::config::Config;
pub use crate::detector::{Detector, DetectorStatus};
pub use crate::discovery::{Discovery, Eligibility, ImageHandle, ImageState, SkipReason};
pub use crate::document::{Document, DocumentEvent, Fragment, ImageElement, ImageFormat, NodeId};
pub use crate::error::{DetectorError, Result};
pub use crate::render::{LoggingSurface, MemorySurface, RenderSurface};
pub use crate::saliency::{SaliencyEngine, SaliencyOverlay};
pub use crate::scheduler::{BatchScheduler, CycleReport};
pub use crate::settings::{InMemorySettings, Settings, SettingsStore};
pub use crate::tensor::{ClassificationScore, OutputInterpretation, Tensor};
