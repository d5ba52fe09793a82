//! Discovery & Filter
//!
//! Finds image nodes in a [`Document`], wraps each one in an [`ImageHandle`]
//! exactly once, and decides whether it is worth classifying. A background
//! observer follows document mutations so images inserted later are picked up
//! without re-evaluating anything already seen.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FilterConfig;
use crate::document::{Document, DocumentEvent, ImageElement, ImageFormat, NodeId};
use crate::metrics;
use crate::tensor::ClassificationScore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    TooSmall,
    TooLarge,
    WrongFormat,
    AlreadyProcessed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::TooSmall => "too-small",
            SkipReason::TooLarge => "too-large",
            SkipReason::WrongFormat => "wrong-format",
            SkipReason::AlreadyProcessed => "already-processed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageState {
    Unchecked,
    Eligible,
    Skipped(SkipReason),
    Queued,
    Scored,
    Errored,
}

impl ImageState {
    /// Forward-only transition table
    fn can_become(&self, next: &ImageState) -> bool {
        matches!(
            (self, next),
            (ImageState::Unchecked, ImageState::Eligible)
                | (ImageState::Unchecked, ImageState::Skipped(_))
                | (ImageState::Eligible, ImageState::Queued)
                | (ImageState::Queued, ImageState::Scored)
                | (ImageState::Queued, ImageState::Errored)
        )
    }
}

/// A discovered image: node reference, metadata captured at load time, and
/// the state the pipeline has moved it through.
pub struct ImageHandle {
    node: NodeId,
    source: String,
    width: u32,
    height: u32,
    format: ImageFormat,
    pixels: Option<Arc<Vec<u8>>>,
    state: Mutex<ImageState>,
    score: Mutex<Option<ClassificationScore>>,
    detached: AtomicBool,
    saliency_ready: AtomicBool,
}

impl ImageHandle {
    pub fn new(node: NodeId, image: &ImageElement) -> Self {
        Self {
            node,
            source: image.source.clone(),
            width: image.natural_width,
            height: image.natural_height,
            format: image.format,
            pixels: image.pixels.clone(),
            state: Mutex::new(ImageState::Unchecked),
            score: Mutex::new(None),
            detached: AtomicBool::new(false),
            saliency_ready: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn pixels(&self) -> Option<&[u8]> {
        self.pixels.as_deref().map(Vec::as_slice)
    }

    pub fn state(&self) -> ImageState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if the transition is allowed; returns whether it happened.
    pub fn try_transition(&self, next: ImageState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_become(&next) {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Record a classification; only a queued handle can be scored
    pub fn record_score(&self, score: ClassificationScore) -> bool {
        if !self.try_transition(ImageState::Scored) {
            return false;
        }
        *self.score.lock().unwrap_or_else(PoisonError::into_inner) = Some(score);
        self.saliency_ready.store(score.is_ai, Ordering::SeqCst);
        true
    }

    pub fn score(&self) -> Option<ClassificationScore> {
        *self.score.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Positively classified and eligible for an explanation
    pub fn is_saliency_ready(&self) -> bool {
        self.saliency_ready.load(Ordering::SeqCst)
    }

    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageHandle")
            .field("node", &self.node)
            .field("source", &self.source)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("state", &self.state())
            .field("detached", &self.is_detached())
            .finish_non_exhaustive()
    }
}

/// Size and content rules; a too-small side wins over a too-large one.
pub fn is_eligible(handle: &ImageHandle, filter: &FilterConfig) -> Eligibility {
    if handle.state() != ImageState::Unchecked {
        return Eligibility::Skipped(SkipReason::AlreadyProcessed);
    }
    if handle.format() != ImageFormat::Raster || handle.pixels().is_none() {
        return Eligibility::Skipped(SkipReason::WrongFormat);
    }

    let (w, h) = handle.dimensions();
    if w < filter.min_size || h < filter.min_size {
        Eligibility::Skipped(SkipReason::TooSmall)
    } else if w > filter.max_size || h > filter.max_size {
        Eligibility::Skipped(SkipReason::TooLarge)
    } else {
        Eligibility::Eligible
    }
}

/// Callback receiving newly eligible handles from the observer
pub type EligibleSink = Arc<dyn Fn(Vec<Arc<ImageHandle>>) + Send + Sync>;

pub struct Discovery {
    document: Arc<Document>,
    filter: FilterConfig,
    handles: DashMap<NodeId, Arc<ImageHandle>>,
    /// Unloaded image nodes waiting for their one load event
    deferred: DashSet<NodeId>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(document: Arc<Document>, filter: FilterConfig) -> Self {
        Self {
            document,
            filter,
            handles: DashMap::new(),
            deferred: DashSet::new(),
            observer: Mutex::new(None),
        }
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    /// Evaluate every image under `root` not seen before; returns the ones
    /// that became eligible, in document order.
    pub fn scan(&self, root: NodeId) -> Vec<Arc<ImageHandle>> {
        let eligible: Vec<Arc<ImageHandle>> = self
            .document
            .images_under(root)
            .into_iter()
            .filter_map(|node| self.evaluate_node(node))
            .collect();

        debug!(root, eligible = eligible.len(), "Scan complete");
        eligible
    }

    fn evaluate_node(&self, node: NodeId) -> Option<Arc<ImageHandle>> {
        if self.deferred.contains(&node) {
            return None;
        }
        let image = self.document.image(node)?;

        if !image.loaded {
            self.deferred.insert(node);
            // The load may have landed between the read above and the insert
            let loaded_meanwhile = self.document.image(node).is_some_and(|i| i.loaded);
            if !(loaded_meanwhile && self.deferred.remove(&node).is_some()) {
                debug!(node, source = %image.source, "Deferring unloaded image");
                return None;
            }
            return self.evaluate_node(node);
        }

        let handle = match self.handles.entry(node) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                let handle = Arc::new(ImageHandle::new(node, &image));
                slot.insert(Arc::clone(&handle));
                handle
            }
        };
        metrics::IMAGES_DISCOVERED.inc();

        match is_eligible(&handle, &self.filter) {
            Eligibility::Eligible => {
                handle.try_transition(ImageState::Eligible);
                Some(handle)
            }
            Eligibility::Skipped(reason) => {
                handle.try_transition(ImageState::Skipped(reason));
                metrics::IMAGES_SKIPPED.with_label_values(&[reason.as_str()]).inc();
                debug!(
                    node,
                    width = handle.width,
                    height = handle.height,
                    reason = %reason,
                    "Skipping image"
                );
                None
            }
        }
    }

    fn handle_event(&self, event: DocumentEvent) -> Vec<Arc<ImageHandle>> {
        match event {
            DocumentEvent::Inserted { images, .. } => images
                .into_iter()
                .filter_map(|node| self.evaluate_node(node))
                .collect(),
            DocumentEvent::Loaded(node) => {
                // One-shot: only nodes still waiting are evaluated
                if self.deferred.remove(&node).is_some() {
                    self.evaluate_node(node).into_iter().collect()
                } else {
                    Vec::new()
                }
            }
            DocumentEvent::Removed { images, .. } => {
                for node in images {
                    self.deferred.remove(&node);
                    if let Some((_, handle)) = self.handles.remove(&node) {
                        handle.detach();
                        debug!(node, "Image removed from document");
                    }
                }
                Vec::new()
            }
        }
    }

    /// Start following document mutations. Subscribes before returning, so
    /// nothing published after this call is missed.
    pub fn observe(self: &Arc<Self>, on_eligible: EligibleSink) {
        let mut events = self.document.subscribe();
        let discovery: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(this) = discovery.upgrade() else {
                    break;
                };

                let eligible = match event {
                    Ok(event) => this.handle_event(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Mutation observer lagged, rescanning document");
                        this.scan(Document::ROOT)
                    }
                    Err(RecvError::Closed) => break,
                };

                if !eligible.is_empty() {
                    on_eligible(eligible);
                }
            }
            debug!("Mutation observer stopped");
        });

        let previous = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Mutation observer started");
    }

    /// Stop following mutations
    pub fn disconnect(&self) {
        if let Some(task) = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            info!("Mutation observer disconnected");
        }
    }

    /// Forget everything seen so far. Every handle is detached so late results
    /// for it are discarded; the next scan starts from scratch.
    pub fn reset(&self) -> Vec<Arc<ImageHandle>> {
        self.disconnect();
        self.deferred.clear();

        let nodes: Vec<NodeId> = self.handles.iter().map(|entry| *entry.key()).collect();
        let forgotten: Vec<Arc<ImageHandle>> = nodes
            .into_iter()
            .filter_map(|node| self.handles.remove(&node).map(|(_, handle)| handle))
            .collect();
        for handle in &forgotten {
            handle.detach();
        }
        forgotten
    }

    pub fn handle(&self, node: NodeId) -> Option<Arc<ImageHandle>> {
        self.handles.get(&node).map(|entry| Arc::clone(entry.value()))
    }

    /// All known handles in node order
    pub fn handles(&self) -> Vec<Arc<ImageHandle>> {
        let mut handles: Vec<Arc<ImageHandle>> =
            self.handles.iter().map(|entry| Arc::clone(entry.value())).collect();
        handles.sort_by_key(|h| h.node());
        handles
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.disconnect();
    }
}
