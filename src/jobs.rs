//! Job slot admission
//!
//! Caps how many saliency jobs run at once. Callers over the limit wait in the
//! semaphore's FIFO queue and are handed a slot as soon as one is released.
//! The queue itself is bounded: once it is full, callers back off for a fixed
//! delay and try again instead of being rejected.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::SaliencyConfig;
use crate::error::{DetectorError, Result};
use crate::metrics;

pub struct JobSlots {
    limit: usize,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    waiting: AtomicUsize,
    max_waiting: usize,
    backoff: Duration,
}

impl JobSlots {
    pub fn new(limit: usize, max_waiting: usize, backoff: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            active: Arc::new(AtomicUsize::new(0)),
            waiting: AtomicUsize::new(0),
            max_waiting,
            backoff,
        }
    }

    pub fn from_config(config: &SaliencyConfig) -> Self {
        Self::new(config.max_concurrent_jobs, config.max_queued_jobs, config.retry_backoff)
    }

    /// Wait for a slot. The returned permit releases it when dropped.
    pub async fn acquire(&self) -> Result<JobPermit> {
        loop {
            if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
                return Ok(self.admit(permit));
            }

            let position = self.waiting.fetch_add(1, Ordering::SeqCst);
            let queued = WaitingGuard(&self.waiting);

            if position < self.max_waiting {
                let permit = Arc::clone(&self.semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| DetectorError::EngineError("job slots closed".into()))?;
                drop(queued);
                return Ok(self.admit(permit));
            }

            drop(queued);
            debug!(
                waiting = position,
                backoff_ms = self.backoff.as_millis() as u64,
                "Job queue full, backing off"
            );
            tokio::time::sleep(self.backoff).await;
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<JobPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.admit(permit))
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> JobPermit {
        self.active.fetch_add(1, Ordering::SeqCst);
        metrics::SALIENCY_ACTIVE_JOBS.inc();
        JobPermit {
            _permit: permit,
            active: Arc::clone(&self.active),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RAII guard that releases a job slot on drop
pub struct JobPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        // Counter first, so a waiter woken by the permit never sees a stale count
        self.active.fetch_sub(1, Ordering::SeqCst);
        metrics::SALIENCY_ACTIVE_JOBS.dec();
    }
}
