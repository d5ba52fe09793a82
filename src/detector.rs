//! Detector lifecycle
//!
//! Owns one pipeline instance: discovery feeding the batch scheduler, the
//! saliency engine for explanations, and a watcher that follows the enabled
//! setting at runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::InferenceBridge;
use crate::config::Config;
use crate::discovery::{Discovery, EligibleSink, ImageHandle};
use crate::document::Document;
use crate::error::{DetectorError, Result};
use crate::retry::retry_with_exponential_backoff;
use crate::render::RenderSurface;
use crate::saliency::{SaliencyEngine, SaliencyOverlay};
use crate::scheduler::BatchScheduler;
use crate::settings::{is_blacklisted, SettingsStore};

/// Lifecycle of a detector instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorStatus {
    /// Page host is blacklisted; nothing was started
    Skipped,
    /// Engine up, waiting for the enabled setting
    Paused,
    Running,
}

pub struct Detector {
    config: Config,
    settings: Arc<dyn SettingsStore>,
    bridge: Arc<dyn InferenceBridge>,
    surface: Arc<dyn RenderSurface>,
    discovery: Arc<Discovery>,
    scheduler: Arc<BatchScheduler>,
    saliency: SaliencyEngine,
    running: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Detector {
    pub fn new(
        config: Config,
        document: Arc<Document>,
        bridge: Arc<dyn InferenceBridge>,
        settings: Arc<dyn SettingsStore>,
        surface: Arc<dyn RenderSurface>,
    ) -> Arc<Self> {
        let discovery = Arc::new(Discovery::new(document, config.filter.clone()));
        let scheduler = Arc::new(BatchScheduler::new(
            Arc::clone(&bridge),
            Arc::clone(&surface),
            config.scheduler.clone(),
        ));
        let saliency = SaliencyEngine::new(Arc::clone(&bridge), &config.saliency)
            .with_interpretation(config.scheduler.interpretation);

        Arc::new(Self {
            config,
            settings,
            bridge,
            surface,
            discovery,
            scheduler,
            saliency,
            running: AtomicBool::new(false),
            watcher: Mutex::new(None),
        })
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }

    pub fn saliency(&self) -> &SaliencyEngine {
        &self.saliency
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bring the engine up and, if enabled, start discovering and classifying.
    ///
    /// Initialization failure is pipeline-wide: nothing is scheduled and the
    /// error is returned so the caller can retry `start` later.
    pub async fn start(self: &Arc<Self>) -> Result<DetectorStatus> {
        if let Some(url) = &self.config.page_url {
            if is_blacklisted(url, &self.settings.get_blacklist()) {
                info!(url = %url, "Page is blacklisted, detector not started");
                return Ok(DetectorStatus::Skipped);
            }
        }

        if !self.bridge.is_ready() {
            let attempts = self.config.bridge.init_attempts;
            let base_delay_ms = self.config.bridge.init_retry_delay.as_millis() as u64;
            if let Err(e) =
                retry_with_exponential_backoff(|| self.bridge.initialize(), attempts, base_delay_ms).await
            {
                error!(error = %e, "Inference engine failed to initialize, detection disabled");
                return Err(match e {
                    DetectorError::InitFailed(_) => e,
                    other => DetectorError::InitFailed(other.to_string()),
                });
            }
        }

        self.watch_settings();

        if self.settings.get_enabled() {
            self.enable();
            Ok(DetectorStatus::Running)
        } else {
            info!("Detection disabled in settings, waiting");
            Ok(DetectorStatus::Paused)
        }
    }

    fn watch_settings(self: &Arc<Self>) {
        let mut changes = self.settings.subscribe();
        let detector: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let enabled = changes.borrow_and_update().enabled;
                let Some(detector) = detector.upgrade() else {
                    break;
                };
                if enabled {
                    detector.enable();
                } else {
                    detector.disable();
                }
            }
        });

        if let Some(previous) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }

    /// Start (or resume) discovery and scheduling
    pub fn enable(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.scheduler.start();

        let scheduler = Arc::downgrade(&self.scheduler);
        let sink: EligibleSink = Arc::new(move |handles: Vec<Arc<ImageHandle>>| {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.enqueue_all(handles);
            }
        });
        self.discovery.observe(sink);

        let eligible = self.discovery.scan(Document::ROOT);
        let queued = self.scheduler.enqueue_all(eligible);
        info!(queued, "🔍 Detection started");
    }

    /// Stop everything and forget what was seen, so re-enabling rescans the
    /// whole document
    pub fn disable(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.discovery.disconnect();
        let dropped = self.scheduler.stop();
        let forgotten = self.discovery.reset();
        for handle in &forgotten {
            self.surface.clear(handle);
        }
        info!(dropped = dropped.len(), forgotten = forgotten.len(), "Detection stopped");
    }

    /// Explain a positively classified image
    pub async fn explain(&self, handle: &ImageHandle) -> Result<Arc<SaliencyOverlay>> {
        if !handle.is_saliency_ready() {
            return Err(DetectorError::InvalidInput(format!(
                "image {} is not a positive classification",
                handle.node()
            )));
        }
        let pixels = handle
            .pixels()
            .ok_or_else(|| DetectorError::InvalidInput("handle has no pixel data".into()))?;
        let (width, height) = handle.dimensions();

        let overlay = self.saliency.generate(pixels, width, height).await?;
        if handle.is_detached() {
            warn!(node = handle.node(), "Image detached before its overlay was ready");
        } else {
            self.surface.apply_overlay(handle, &overlay);
        }
        Ok(overlay)
    }

    /// Resolve once no classification work is queued or running
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.discovery.disconnect();
        self.scheduler.stop();
        self.running.store(false, Ordering::SeqCst);
        info!("Detector shut down");
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        if let Some(task) = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}
