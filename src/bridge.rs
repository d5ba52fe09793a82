//! Inference Bridge
//!
//! Gets a tensor to the model provider and a result (or typed failure) back.
//!
//! - **Direct**: the engine lives in this context and is awaited in place.
//! - **Isolated**: the engine runs inside its own host task and is reachable only
//!   through byte messages. Every crossing is a postcard-encoded [`Envelope`]
//!   carrying a correlation id; replies are matched against a pending map and
//!   anything for an unknown id is dropped.
//!
//! ```text
//!  IsolatedBridge                         engine host task
//!  ──────────────                         ────────────────
//!  INIT(id) ─────────────────────────────▶ initialize + warm up
//!           ◀───────────────────────────── READY(id) | ERROR(id)
//!  INFER_REQUEST(id, tensor, deadline) ──▶ engine.run
//!           ◀───────────────────────────── INFER_RESULT(id) | INFER_ERROR(id)
//! ```

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{BridgeConfig, CLASSIFY_INPUT_SIZE};
use crate::error::{DetectorError, Result};
use crate::metrics::{self, Timer};
use crate::tensor::Tensor;

// ============================================================================
// Engine and bridge traits
// ============================================================================

/// Model/session provider. Opaque to the pipeline beyond tensor in, tensor out.
pub trait InferenceEngine: Send + Sync + 'static {
    /// Load whatever the engine needs before the first `run`
    fn initialize(&self) -> BoxFuture<'_, Result<()>>;

    fn run(&self, input: Tensor) -> BoxFuture<'_, Result<Tensor>>;
}

/// What the scheduler and saliency engine talk to
pub trait InferenceBridge: Send + Sync {
    /// Bring the engine up; calls made before this succeeds fail with `NotReady`
    fn initialize(&self) -> BoxFuture<'_, Result<()>>;

    fn invoke(&self, input: Tensor) -> BoxFuture<'_, Result<Tensor>>;

    fn is_ready(&self) -> bool;
}

/// Initialize an engine and push one dummy classification input through it.
async fn prepare_engine(engine: &dyn InferenceEngine) -> Result<()> {
    engine
        .initialize()
        .await
        .map_err(|e| DetectorError::InitFailed(e.to_string()))?;

    engine
        .run(Tensor::zeros_image(CLASSIFY_INPUT_SIZE as usize))
        .await
        .map_err(|e| DetectorError::InitFailed(format!("warm-up failed: {}", e)))?;

    Ok(())
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Direct mode
// ============================================================================

/// Engine reachable in the same context
pub struct DirectBridge {
    engine: Arc<dyn InferenceEngine>,
    ready: AtomicBool,
    request_timeout: Duration,
}

impl DirectBridge {
    pub fn new(engine: Arc<dyn InferenceEngine>, config: &BridgeConfig) -> Self {
        Self {
            engine,
            ready: AtomicBool::new(false),
            request_timeout: config.request_timeout,
        }
    }

    async fn invoke_inner(&self, input: Tensor) -> Result<Tensor> {
        if !self.is_ready() {
            return Err(DetectorError::NotReady);
        }
        input.validate_image_input()?;

        let timer = Timer::new();
        let output = tokio::time::timeout(self.request_timeout, self.engine.run(input))
            .await
            .map_err(|_| {
                metrics::BRIDGE_TIMEOUTS.inc();
                DetectorError::Timeout(self.request_timeout.as_millis() as u64)
            })??;
        timer.observe_duration_seconds(&metrics::INFERENCE_LATENCY);

        Ok(output)
    }
}

impl InferenceBridge for DirectBridge {
    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            prepare_engine(self.engine.as_ref()).await?;
            self.ready.store(true, Ordering::SeqCst);
            info!("Inference engine ready (direct)");
            Ok(())
        }
        .boxed()
    }

    fn invoke(&self, input: Tensor) -> BoxFuture<'_, Result<Tensor>> {
        self.invoke_inner(input).boxed()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Init,
    Ready,
    Error,
    InferRequest,
    InferResult,
    InferError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Tensor(Tensor),
    Failure(DetectorError),
}

/// Message crossing the isolated boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Correlates a reply with its request
    pub id: Uuid,
    /// Unix milliseconds after which the host should not bother running the request
    pub deadline: Option<u64>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(kind: MessageKind, id: Uuid, payload: Payload) -> Self {
        Self {
            kind,
            id,
            deadline: None,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Both ends of the byte channel between a bridge and its engine host
pub struct EngineChannel {
    pub to_host: mpsc::Sender<Vec<u8>>,
    pub from_host: mpsc::Receiver<Vec<u8>>,
}

// ============================================================================
// Engine host
// ============================================================================

/// Run `engine` inside its own task, reachable only through the returned channel.
pub fn spawn_engine_host(
    engine: Arc<dyn InferenceEngine>,
    capacity: usize,
) -> (EngineChannel, JoinHandle<()>) {
    let (to_host, inbox) = mpsc::channel(capacity);
    let (outbox, from_host) = mpsc::channel(capacity);

    let handle = tokio::spawn(run_engine_host(engine, inbox, outbox));

    (EngineChannel { to_host, from_host }, handle)
}

async fn send_envelope(outbox: &mpsc::Sender<Vec<u8>>, envelope: Envelope) {
    match envelope.encode() {
        Ok(bytes) => {
            if outbox.send(bytes).await.is_err() {
                warn!(id = %envelope.id, "Failed to send reply - channel closed");
            }
        }
        Err(e) => error!(id = %envelope.id, error = %e, "Failed to encode reply"),
    }
}

async fn run_engine_host(
    engine: Arc<dyn InferenceEngine>,
    mut inbox: mpsc::Receiver<Vec<u8>>,
    outbox: mpsc::Sender<Vec<u8>>,
) {
    let initialized = Arc::new(AtomicBool::new(false));
    debug!("Engine host started");

    while let Some(bytes) = inbox.recv().await {
        let envelope = match Envelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Engine host dropped undecodable message");
                continue;
            }
        };
        let id = envelope.id;

        match envelope.kind {
            MessageKind::Init => {
                let reply = match prepare_engine(engine.as_ref()).await {
                    Ok(()) => {
                        initialized.store(true, Ordering::SeqCst);
                        Envelope::new(MessageKind::Ready, id, Payload::Empty)
                    }
                    Err(e) => {
                        error!(error = %e, "Engine host initialization failed");
                        Envelope::new(MessageKind::Error, id, Payload::Failure(e))
                    }
                };
                send_envelope(&outbox, reply).await;
            }
            MessageKind::InferRequest => {
                let engine = Arc::clone(&engine);
                let outbox = outbox.clone();
                let initialized = Arc::clone(&initialized);

                tokio::spawn(async move {
                    let expired = envelope.deadline.is_some_and(|d| epoch_millis() > d);
                    let result = if !initialized.load(Ordering::SeqCst) {
                        Err(DetectorError::NotReady)
                    } else if expired {
                        Err(DetectorError::Timeout(0))
                    } else {
                        match envelope.payload {
                            Payload::Tensor(input) => engine.run(input).await,
                            _ => Err(DetectorError::InvalidInput(
                                "inference request without tensor".into(),
                            )),
                        }
                    };

                    let reply = match result {
                        Ok(output) => Envelope::new(MessageKind::InferResult, id, Payload::Tensor(output)),
                        Err(e) => Envelope::new(MessageKind::InferError, id, Payload::Failure(e)),
                    };
                    send_envelope(&outbox, reply).await;
                });
            }
            other => debug!(kind = ?other, "Engine host ignoring message"),
        }
    }

    debug!("Engine host stopped");
}

// ============================================================================
// Isolated mode
// ============================================================================

type PendingMap = DashMap<Uuid, oneshot::Sender<Result<Payload>>>;

/// Deregisters a correlation id however the waiting call ends
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Engine reachable only through message passing
pub struct IsolatedBridge {
    outbound: mpsc::Sender<Vec<u8>>,
    pending: Arc<PendingMap>,
    ready: Arc<AtomicBool>,
    config: BridgeConfig,
    dispatcher: JoinHandle<()>,
}

impl IsolatedBridge {
    /// Attach to an engine host and start routing its replies.
    pub fn connect(channel: EngineChannel, config: &BridgeConfig) -> Self {
        let pending = Arc::new(PendingMap::new());
        let ready = Arc::new(AtomicBool::new(false));

        let dispatcher = tokio::spawn(dispatch_replies(
            channel.from_host,
            Arc::clone(&pending),
            Arc::clone(&ready),
        ));

        Self {
            outbound: channel.to_host,
            pending,
            ready,
            config: config.clone(),
            dispatcher,
        }
    }

    /// Spawn a host for `engine` and connect to it
    pub fn spawn(engine: Arc<dyn InferenceEngine>, config: &BridgeConfig) -> Self {
        let (channel, _host) = spawn_engine_host(engine, config.channel_capacity);
        Self::connect(channel, config)
    }

    /// Requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    async fn request(
        &self,
        kind: MessageKind,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload> {
        let id = Uuid::new_v4();
        let (responder, reply) = oneshot::channel();
        self.pending.insert(id, responder);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let envelope = Envelope {
            kind,
            id,
            deadline: Some(epoch_millis() + timeout.as_millis() as u64),
            payload,
        };
        let bytes = envelope.encode()?;

        let exchange = async {
            self.outbound
                .send(bytes)
                .await
                .map_err(|_| DetectorError::Transport("engine host channel closed".into()))?;
            reply
                .await
                .map_err(|_| DetectorError::Transport("engine host dropped request".into()))?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                metrics::BRIDGE_TIMEOUTS.inc();
                warn!(id = %id, kind = ?kind, timeout_ms = timeout.as_millis() as u64, "Bridge request timed out");
                Err(DetectorError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    async fn initialize_inner(&self) -> Result<()> {
        match self
            .request(MessageKind::Init, Payload::Empty, self.config.init_timeout)
            .await
        {
            Ok(_) => {
                self.ready.store(true, Ordering::SeqCst);
                info!("Inference engine ready (isolated)");
                Ok(())
            }
            Err(e @ (DetectorError::InitFailed(_) | DetectorError::Timeout(_))) => Err(e),
            Err(other) => Err(DetectorError::InitFailed(other.to_string())),
        }
    }

    async fn invoke_inner(&self, input: Tensor) -> Result<Tensor> {
        if !self.is_ready() {
            return Err(DetectorError::NotReady);
        }
        input.validate_image_input()?;

        let timer = Timer::new();
        let payload = self
            .request(MessageKind::InferRequest, Payload::Tensor(input), self.config.request_timeout)
            .await?;
        timer.observe_duration_seconds(&metrics::INFERENCE_LATENCY);

        match payload {
            Payload::Tensor(output) => Ok(output),
            other => Err(DetectorError::Transport(format!(
                "unexpected reply payload: {:?}",
                other
            ))),
        }
    }
}

impl InferenceBridge for IsolatedBridge {
    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        self.initialize_inner().boxed()
    }

    fn invoke(&self, input: Tensor) -> BoxFuture<'_, Result<Tensor>> {
        self.invoke_inner(input).boxed()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Drop for IsolatedBridge {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_replies(
    mut inbound: mpsc::Receiver<Vec<u8>>,
    pending: Arc<PendingMap>,
    ready: Arc<AtomicBool>,
) {
    while let Some(bytes) = inbound.recv().await {
        let envelope = match Envelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable reply");
                continue;
            }
        };
        let id = envelope.id;

        let outcome = match envelope.kind {
            MessageKind::Ready | MessageKind::InferResult => Ok(envelope.payload),
            MessageKind::Error | MessageKind::InferError => Err(match envelope.payload {
                Payload::Failure(e) => e,
                _ => DetectorError::EngineError("unspecified engine failure".into()),
            }),
            MessageKind::Init | MessageKind::InferRequest => {
                debug!(id = %id, "Ignoring request-type message on reply channel");
                continue;
            }
        };

        match pending.remove(&id) {
            Some((_, responder)) => {
                // Receiver may have given up in the meantime
                let _ = responder.send(outcome);
            }
            None => {
                metrics::BRIDGE_STALE_RESPONSES.inc();
                debug!(id = %id, "Ignoring reply for unknown or expired request");
            }
        }
    }

    ready.store(false, Ordering::SeqCst);
    pending.clear();
    warn!("Engine host channel closed, bridge no longer ready");
}

/// Build the bridge selected by configuration
pub fn build_bridge(
    engine: Arc<dyn InferenceEngine>,
    config: &BridgeConfig,
    isolated: bool,
) -> Arc<dyn InferenceBridge> {
    if isolated {
        Arc::new(IsolatedBridge::spawn(engine, config))
    } else {
        Arc::new(DirectBridge::new(engine, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEngine {
        output: Vec<f32>,
        delay: Duration,
        fail_init: bool,
    }

    impl FixedEngine {
        fn new(output: Vec<f32>) -> Arc<Self> {
            Arc::new(Self {
                output,
                delay: Duration::ZERO,
                fail_init: false,
            })
        }
    }

    impl InferenceEngine for FixedEngine {
        fn initialize(&self) -> BoxFuture<'_, Result<()>> {
            async move {
                if self.fail_init {
                    Err(DetectorError::EngineError("model file missing".into()))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }

        fn run(&self, _input: Tensor) -> BoxFuture<'_, Result<Tensor>> {
            async move {
                tokio::time::sleep(self.delay).await;
                Tensor::new(vec![1, self.output.len()], self.output.clone())
            }
            .boxed()
        }
    }

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            init_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(200),
            channel_capacity: 8,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_direct_bridge_requires_initialization() {
        let bridge = DirectBridge::new(FixedEngine::new(vec![0.9]), &fast_config());

        let early = bridge.invoke(Tensor::zeros_image(4)).await;
        assert_eq!(early, Err(DetectorError::NotReady));

        bridge.initialize().await.unwrap();
        assert!(bridge.is_ready());
        let output = bridge.invoke(Tensor::zeros_image(4)).await.unwrap();
        assert_eq!(output.data(), &[0.9]);
    }

    #[tokio::test]
    async fn test_direct_bridge_rejects_malformed_tensor() {
        let bridge = DirectBridge::new(FixedEngine::new(vec![0.1]), &fast_config());
        bridge.initialize().await.unwrap();

        let bad = Tensor::new(vec![1, 4, 4], vec![0.0; 16]).unwrap();
        assert!(matches!(bridge.invoke(bad).await, Err(DetectorError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_isolated_round_trip() {
        let bridge = IsolatedBridge::spawn(FixedEngine::new(vec![-1.0, 3.0]), &fast_config());

        assert_eq!(bridge.invoke(Tensor::zeros_image(4)).await, Err(DetectorError::NotReady));

        bridge.initialize().await.unwrap();
        let output = bridge.invoke(Tensor::zeros_image(4)).await.unwrap();
        assert_eq!(output.data(), &[-1.0, 3.0]);
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_isolated_init_failure_is_typed() {
        let engine = Arc::new(FixedEngine {
            output: vec![0.5],
            delay: Duration::ZERO,
            fail_init: true,
        });
        let bridge = IsolatedBridge::spawn(engine, &fast_config());

        let result = bridge.initialize().await;
        assert!(matches!(result, Err(DetectorError::InitFailed(_))));
        assert!(!bridge.is_ready());
    }

    #[tokio::test]
    async fn test_isolated_timeout_deregisters_request() {
        let engine = Arc::new(FixedEngine {
            output: vec![0.5],
            delay: Duration::from_millis(150),
            fail_init: false,
        });
        let config = BridgeConfig {
            init_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_millis(50),
            channel_capacity: 8,
            ..Default::default()
        };
        let bridge = IsolatedBridge::spawn(engine, &config);
        bridge.initialize().await.unwrap();

        let result = bridge.invoke(Tensor::zeros_image(4)).await;
        assert_eq!(result, Err(DetectorError::Timeout(50)));
        assert_eq!(bridge.pending_requests(), 0);

        // The late reply arrives for an id nobody waits on any more
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_isolated_ignores_stale_replies() {
        let (to_host, mut inbox) = mpsc::channel::<Vec<u8>>(8);
        let (outbox, from_host) = mpsc::channel::<Vec<u8>>(8);

        // Hand-rolled host that answers every request twice: once with a
        // foreign id, then with the real one.
        tokio::spawn(async move {
            while let Some(bytes) = inbox.recv().await {
                let request = Envelope::decode(&bytes).unwrap();
                let kind = match request.kind {
                    MessageKind::Init => MessageKind::Ready,
                    _ => MessageKind::InferResult,
                };
                let bogus = Envelope::new(
                    kind,
                    Uuid::new_v4(),
                    Payload::Tensor(Tensor::new(vec![1], vec![0.0]).unwrap()),
                );
                outbox.send(bogus.encode().unwrap()).await.unwrap();
                let real = Envelope::new(
                    kind,
                    request.id,
                    Payload::Tensor(Tensor::new(vec![1], vec![0.75]).unwrap()),
                );
                outbox.send(real.encode().unwrap()).await.unwrap();
            }
        });

        let bridge = IsolatedBridge::connect(EngineChannel { to_host, from_host }, &fast_config());
        bridge.initialize().await.unwrap();

        let output = bridge.invoke(Tensor::zeros_image(2)).await.unwrap();
        assert_eq!(output.data(), &[0.75]);
    }

    #[tokio::test]
    async fn test_closed_host_clears_readiness() {
        let (to_host, inbox) = mpsc::channel::<Vec<u8>>(8);
        let (outbox, from_host) = mpsc::channel::<Vec<u8>>(8);
        let bridge = IsolatedBridge::connect(EngineChannel { to_host, from_host }, &fast_config());

        drop(inbox);
        drop(outbox);

        let result = bridge.initialize().await;
        assert!(matches!(result, Err(DetectorError::InitFailed(_))));
        assert!(!bridge.is_ready());
    }

    #[tokio::test]
    async fn test_silent_host_times_out_init() {
        let (to_host, mut inbox) = mpsc::channel::<Vec<u8>>(8);
        let (outbox, from_host) = mpsc::channel::<Vec<u8>>(8);

        // Swallows every request and never answers
        tokio::spawn(async move {
            let _outbox = outbox;
            while inbox.recv().await.is_some() {}
        });

        let config = BridgeConfig {
            init_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let bridge = IsolatedBridge::connect(EngineChannel { to_host, from_host }, &config);

        let result = bridge.initialize().await;
        assert_eq!(result, Err(DetectorError::Timeout(50)));
        assert!(result.unwrap_err().is_recoverable());
        assert!(!bridge.is_ready());
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::new(
            MessageKind::InferError,
            Uuid::new_v4(),
            Payload::Failure(DetectorError::EngineError("oom".into())),
        );
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }
}
