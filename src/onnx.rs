//! ONNX Runtime engine
//!
//! Wraps an `ort` session behind [`InferenceEngine`]. Session calls are
//! synchronous, so both loading and `run` go through the blocking pool.

use futures::future::{BoxFuture, FutureExt};
use ndarray::{ArrayD, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::bridge::InferenceEngine;
use crate::error::{DetectorError, Result};
use crate::tensor::Tensor;

/// Input name used when the model does not report one
const DEFAULT_INPUT_NAME: &str = "input";

pub struct OnnxEngine {
    model_path: PathBuf,
    intra_threads: usize,
    session: Arc<Mutex<Option<Session>>>,
}

impl OnnxEngine {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            intra_threads: 1,
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads.max(1);
        self
    }

    fn load_session(path: &PathBuf, threads: usize) -> Result<Session> {
        let engine_err = |e: ort::Error| DetectorError::InitFailed(format!("{}: {}", path.display(), e));

        Session::builder()
            .map_err(engine_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(engine_err)?
            .with_intra_threads(threads)
            .map_err(engine_err)?
            .commit_from_file(path)
            .map_err(engine_err)
    }

    fn run_blocking(session: &Mutex<Option<Session>>, input: Tensor) -> Result<Tensor> {
        let engine_err = |e: ort::Error| DetectorError::EngineError(e.to_string());

        let mut guard = session
            .lock()
            .map_err(|_| DetectorError::EngineError("session lock poisoned".into()))?;
        let session = guard.as_mut().ok_or(DetectorError::NotReady)?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| DEFAULT_INPUT_NAME.to_string());
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| DetectorError::EngineError("model has no outputs".into()))?;

        let shape = input.shape().to_vec();
        let array = ArrayD::from_shape_vec(IxDyn(&shape), input.into_data())
            .map_err(|e| DetectorError::InvalidInput(e.to_string()))?;
        let value = ort::value::Tensor::from_array(array).map_err(engine_err)?;

        let outputs = session
            .run(ort::inputs![input_name.as_str() => value])
            .map_err(engine_err)?;

        let view = outputs[output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(engine_err)?;

        Tensor::new(view.shape().to_vec(), view.iter().copied().collect())
    }
}

impl InferenceEngine for OnnxEngine {
    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            let path = self.model_path.clone();
            let threads = self.intra_threads;
            let session = tokio::task::spawn_blocking(move || Self::load_session(&path, threads))
                .await
                .map_err(|e| DetectorError::InitFailed(format!("loader task failed: {}", e)))??;

            let mut slot = self
                .session
                .lock()
                .map_err(|_| DetectorError::InitFailed("session lock poisoned".into()))?;
            *slot = Some(session);

            info!(model = %self.model_path.display(), "ONNX session loaded");
            Ok(())
        }
        .boxed()
    }

    fn run(&self, input: Tensor) -> BoxFuture<'_, Result<Tensor>> {
        let session = Arc::clone(&self.session);
        async move {
            debug!(shape = ?input.shape(), "Running ONNX inference");
            tokio::task::spawn_blocking(move || Self::run_blocking(&session, input))
                .await
                .map_err(|e| DetectorError::EngineError(format!("inference task failed: {}", e)))?
        }
        .boxed()
    }
}
