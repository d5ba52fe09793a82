//! Batch Scheduler
//!
//! Eligible images wait in a FIFO queue. The first enqueue of an idle period
//! arms a single-shot debounce timer; when it fires, cycles of at most
//! `max_batch_size` items run back to back until the queue is empty. Items in
//! a cycle are classified one at a time, in enqueue order, with a yield to the
//! runtime after each.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::InferenceBridge;
use crate::config::{SchedulerConfig, CLASSIFY_INPUT_SIZE};
use crate::discovery::{ImageHandle, ImageState};
use crate::document::NodeId;
use crate::error::{DetectorError, Result};
use crate::metrics;
use crate::render::RenderSurface;
use crate::tensor::{self, ClassificationScore};

/// Summary published after every cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Nodes taken off the queue in this cycle, in processing order
    pub processed: Vec<NodeId>,
    pub scored: usize,
    pub errored: usize,
    /// Detached before or during processing; no side effects applied
    pub discarded: usize,
}

enum ItemOutcome {
    Scored,
    Errored,
    Discarded,
}

pub struct BatchScheduler {
    bridge: Arc<dyn InferenceBridge>,
    surface: Arc<dyn RenderSurface>,
    config: SchedulerConfig,
    queue: Mutex<VecDeque<Arc<ImageHandle>>>,
    running: AtomicBool,
    timer_pending: AtomicBool,
    processing: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    cycles: AtomicU64,
    reports: broadcast::Sender<CycleReport>,
    idle: Notify,
}

impl BatchScheduler {
    pub fn new(
        bridge: Arc<dyn InferenceBridge>,
        surface: Arc<dyn RenderSurface>,
        config: SchedulerConfig,
    ) -> Self {
        let (reports, _) = broadcast::channel(64);
        Self {
            bridge,
            surface,
            config,
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            timer_pending: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            timer: Mutex::new(None),
            cycles: AtomicU64::new(0),
            reports,
            idle: Notify::new(),
        }
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<CycleReport> {
        self.reports.subscribe()
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<ImageHandle>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue_len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Nothing queued, no timer armed and no cycle in flight
    pub fn is_idle(&self) -> bool {
        !self.timer_pending.load(Ordering::SeqCst)
            && !self.processing.load(Ordering::SeqCst)
            && self.queue().is_empty()
    }

    /// Queue an eligible handle. Handles already queued or past that point
    /// are refused, so each image is enqueued at most once. A stopped
    /// scheduler refuses everything and leaves the handle untouched.
    pub fn enqueue(self: &Arc<Self>, handle: Arc<ImageHandle>) -> bool {
        if !self.is_running() {
            debug!(node = handle.node(), "Scheduler stopped, not enqueueing");
            return false;
        }
        if !handle.try_transition(ImageState::Queued) {
            debug!(node = handle.node(), state = ?handle.state(), "Not enqueueing handle");
            return false;
        }

        let depth = {
            let mut queue = self.queue();
            queue.push_back(handle);
            queue.len()
        };
        metrics::QUEUE_DEPTH.set(depth as i64);

        self.arm_timer();
        true
    }

    pub fn enqueue_all(self: &Arc<Self>, handles: impl IntoIterator<Item = Arc<ImageHandle>>) -> usize {
        handles.into_iter().filter(|h| self.enqueue(Arc::clone(h))).count()
    }

    /// Single-shot debounce: a pending timer is never pushed back by new arrivals
    fn arm_timer(self: &Arc<Self>) {
        if !self.is_running() || self.processing.load(Ordering::SeqCst) {
            return;
        }
        if self.timer_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = Arc::clone(self);
        let interval = self.config.batch_interval;
        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            // Cycles run outside the timer task so stopping never cancels one mid-flight
            tokio::spawn(this.run_cycles());
        });

        if let Some(previous) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }

    fn take_batch(&self) -> Vec<Arc<ImageHandle>> {
        let mut queue = self.queue();
        let count = queue.len().min(self.config.max_batch_size.max(1));
        let batch: Vec<Arc<ImageHandle>> = queue.drain(..count).collect();
        metrics::QUEUE_DEPTH.set(queue.len() as i64);
        batch
    }

    async fn run_cycles(self: Arc<Self>) {
        let acquired = self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.timer_pending.store(false, Ordering::SeqCst);
        if !acquired {
            // The cycle already in flight drains whatever is queued
            return;
        }

        while self.is_running() {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }
            self.run_cycle(batch).await;
        }

        self.processing.store(false, Ordering::SeqCst);

        // Something may have been queued after the last empty check
        if self.is_running() && self.queue_len() > 0 {
            self.arm_timer();
        } else {
            self.idle.notify_waiters();
        }
    }

    async fn run_cycle(&self, batch: Vec<Arc<ImageHandle>>) {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::BATCH_CYCLES.inc();
        debug!(cycle, size = batch.len(), "Starting batch cycle");

        let mut report = CycleReport {
            cycle,
            processed: Vec::with_capacity(batch.len()),
            scored: 0,
            errored: 0,
            discarded: 0,
        };

        for handle in batch {
            if !self.is_running() {
                debug!(cycle, "Scheduler stopped, abandoning rest of cycle");
                break;
            }

            let started = Instant::now();
            report.processed.push(handle.node());
            match self.process_item(&handle).await {
                ItemOutcome::Scored => report.scored += 1,
                ItemOutcome::Errored => report.errored += 1,
                ItemOutcome::Discarded => report.discarded += 1,
            }

            tokio::task::yield_now().await;
            if started.elapsed() > self.config.item_budget {
                tokio::time::sleep(self.config.idle_delay).await;
            }
        }

        info!(
            cycle,
            processed = report.processed.len(),
            scored = report.scored,
            errored = report.errored,
            "Batch cycle complete"
        );
        let _ = self.reports.send(report);
    }

    async fn classify(&self, handle: &ImageHandle) -> Result<ClassificationScore> {
        let pixels = handle
            .pixels()
            .ok_or_else(|| DetectorError::InvalidInput("handle has no pixel data".into()))?;
        let (width, height) = handle.dimensions();

        let input = tensor::encode(pixels, width, height, CLASSIFY_INPUT_SIZE)?;
        let output = self.bridge.invoke(input).await?;
        tensor::decode(output.data(), self.config.interpretation)
    }

    async fn process_item(&self, handle: &ImageHandle) -> ItemOutcome {
        if handle.is_detached() {
            return ItemOutcome::Discarded;
        }

        let result = self.classify(handle).await;

        // The node may have left the document while inference was running
        if handle.is_detached() {
            debug!(node = handle.node(), "Discarding result for detached image");
            return ItemOutcome::Discarded;
        }

        match result {
            Ok(score) => {
                if !handle.record_score(score) {
                    return ItemOutcome::Discarded;
                }
                metrics::IMAGES_SCORED.inc();
                debug!(node = handle.node(), probability = score.probability, is_ai = score.is_ai, "Image scored");
                self.surface.apply_classification(handle, &score);
                ItemOutcome::Scored
            }
            Err(e) => {
                handle.try_transition(ImageState::Errored);
                metrics::IMAGES_ERRORED.inc();
                match &e {
                    DetectorError::InvalidInput(_) => {
                        error!(node = handle.node(), error = %e, "Rejected classification input")
                    }
                    _ => warn!(node = handle.node(), source = %handle.source(), error = %e, "Classification failed"),
                }
                ItemOutcome::Errored
            }
        }
    }

    /// Resume after [`stop`](Self::stop); anything still queued gets a fresh timer
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Batch scheduler started");
        if self.queue_len() > 0 {
            self.arm_timer();
        }
    }

    /// Stop scheduling: cancel the pending timer and empty the queue. A cycle
    /// already in flight finishes its current item and stops.
    pub fn stop(&self) -> Vec<Arc<ImageHandle>> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(task) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.timer_pending.store(false, Ordering::SeqCst);

        let drained: Vec<Arc<ImageHandle>> = self.queue().drain(..).collect();
        metrics::QUEUE_DEPTH.set(0);
        info!(dropped = drained.len(), "Batch scheduler stopped");

        self.idle.notify_waiters();
        drained
    }

    /// Resolve once the scheduler has nothing left to do
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::DirectBridge;
    use crate::bridge::InferenceEngine;
    use crate::config::BridgeConfig;
    use crate::document::ImageElement;
    use crate::render::MemorySurface;
    use crate::tensor::Tensor;
    use futures::future::{BoxFuture, FutureExt};
    use std::time::Duration;

    struct ConstantEngine(f32);

    impl InferenceEngine for ConstantEngine {
        fn initialize(&self) -> BoxFuture<'_, Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn run(&self, _input: Tensor) -> BoxFuture<'_, Result<Tensor>> {
            let value = self.0;
            async move { Tensor::new(vec![1, 1], vec![value]) }.boxed()
        }
    }

    fn eligible_handle(node: NodeId) -> Arc<ImageHandle> {
        let handle = Arc::new(ImageHandle::new(
            node,
            &ImageElement::raster("mem://img", 160, 160, vec![90; 160 * 160 * 4]),
        ));
        assert!(handle.try_transition(ImageState::Eligible));
        handle
    }

    async fn scheduler(value: f32, config: SchedulerConfig) -> (Arc<BatchScheduler>, Arc<MemorySurface>) {
        let bridge = Arc::new(DirectBridge::new(Arc::new(ConstantEngine(value)), &BridgeConfig::default()));
        bridge.initialize().await.unwrap();
        let surface = Arc::new(MemorySurface::new());
        let scheduler = Arc::new(BatchScheduler::new(bridge, surface.clone(), config));
        (scheduler, surface)
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            batch_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_handle_is_enqueued_once() {
        let (scheduler, _) = scheduler(0.9, fast_config()).await;
        let handle = eligible_handle(1);

        assert!(scheduler.enqueue(Arc::clone(&handle)));
        assert!(!scheduler.enqueue(Arc::clone(&handle)));
        assert_eq!(scheduler.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_scores_and_renders() {
        let (scheduler, surface) = scheduler(0.9, fast_config()).await;
        let handles: Vec<_> = (1..=3).map(eligible_handle).collect();
        scheduler.enqueue_all(handles.clone());

        tokio::time::timeout(Duration::from_secs(2), scheduler.wait_idle()).await.unwrap();
        for handle in &handles {
            assert_eq!(handle.state(), ImageState::Scored);
            assert!(handle.is_saliency_ready());
            assert!(surface.classification(handle.node()).unwrap().is_ai);
        }
    }

    #[tokio::test]
    async fn test_detached_handles_get_no_side_effects() {
        let (scheduler, surface) = scheduler(0.2, fast_config()).await;
        let kept = eligible_handle(1);
        let gone = eligible_handle(2);
        scheduler.enqueue_all([Arc::clone(&kept), Arc::clone(&gone)]);
        gone.detach();

        let mut reports = scheduler.subscribe_reports();
        let report = tokio::time::timeout(Duration::from_secs(2), reports.recv()).await.unwrap().unwrap();
        assert_eq!(report.scored, 1);
        assert_eq!(report.discarded, 1);
        assert!(surface.classification(1).is_some());
        assert!(surface.classification(2).is_none());
        assert_eq!(gone.state(), ImageState::Queued);
    }

    #[tokio::test]
    async fn test_stop_clears_queue_and_timer() {
        let config = SchedulerConfig {
            batch_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let (scheduler, surface) = scheduler(0.9, config).await;
        scheduler.enqueue_all((1..=4).map(eligible_handle));

        let dropped = scheduler.stop();
        assert_eq!(dropped.len(), 4);
        assert!(scheduler.is_idle());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(surface.classified_count(), 0);

        // Stopped schedulers refuse new work and stay idle
        let late = eligible_handle(9);
        assert!(!scheduler.enqueue(Arc::clone(&late)));
        assert_eq!(late.state(), ImageState::Eligible);
        assert!(scheduler.is_idle());
        tokio::time::timeout(Duration::from_millis(200), scheduler.wait_idle()).await.unwrap();

        scheduler.start();
        assert!(scheduler.enqueue(late));
        tokio::time::timeout(Duration::from_secs(2), scheduler.wait_idle()).await.unwrap();
        assert_eq!(surface.classified_count(), 1);
    }

    /// Fails any input whose first channel value is saturated
    struct SaturationEngine;

    impl InferenceEngine for SaturationEngine {
        fn initialize(&self) -> BoxFuture<'_, Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn run(&self, input: Tensor) -> BoxFuture<'_, Result<Tensor>> {
            async move {
                if input.data().first().copied().unwrap_or(0.0) > 0.95 {
                    return Err(DetectorError::EngineError("saturated input".into()));
                }
                Tensor::new(vec![1, 1], vec![0.7])
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_failed_item_does_not_stop_cycle() {
        let bridge = Arc::new(DirectBridge::new(Arc::new(SaturationEngine), &BridgeConfig::default()));
        bridge.initialize().await.unwrap();
        let surface = Arc::new(MemorySurface::new());
        let scheduler = Arc::new(BatchScheduler::new(bridge, surface.clone(), fast_config()));

        let shaded = |node: NodeId, shade: u8| {
            let handle = Arc::new(ImageHandle::new(
                node,
                &ImageElement::raster("mem://img", 160, 160, vec![shade; 160 * 160 * 4]),
            ));
            assert!(handle.try_transition(ImageState::Eligible));
            handle
        };
        let handles = vec![shaded(1, 40), shaded(2, 255), shaded(3, 120), shaded(4, 200)];

        let mut reports = scheduler.subscribe_reports();
        assert_eq!(scheduler.enqueue_all(handles.clone()), 4);
        let report = tokio::time::timeout(Duration::from_secs(2), reports.recv()).await.unwrap().unwrap();

        assert_eq!(report.processed, vec![1, 2, 3, 4]);
        assert_eq!(report.errored, 1);
        assert_eq!(report.scored, 3);
        assert_eq!(handles[1].state(), ImageState::Errored);
        assert!(handles[1].score().is_none());
        for handle in [&handles[0], &handles[2], &handles[3]] {
            assert_eq!(handle.state(), ImageState::Scored);
        }
        assert!(surface.classification(2).is_none());
        assert_eq!(surface.classified_count(), 3);
    }
}
