use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DetectorError {
    #[error("Inference engine not ready")]
    NotReady,

    #[error("No response within {0}ms")]
    Timeout(u64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Inference engine error: {0}")]
    EngineError(String),

    #[error("Engine initialization failed: {0}")]
    InitFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Image error: {0}")]
    Image(String),
}

impl DetectorError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DetectorError::NotReady
                | DetectorError::Timeout(_)
                | DetectorError::InitFailed(_)
                | DetectorError::Transport(_)
        )
    }

    /// Initialization failures disable the whole pipeline, everything else
    /// stays isolated to a single image
    pub fn is_pipeline_wide(&self) -> bool {
        matches!(self, DetectorError::InitFailed(_))
    }
}

impl From<image::ImageError> for DetectorError {
    fn from(err: image::ImageError) -> Self {
        DetectorError::Image(err.to_string())
    }
}

impl From<postcard::Error> for DetectorError {
    fn from(err: postcard::Error) -> Self {
        DetectorError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DetectorError>;
