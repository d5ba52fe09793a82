//! Integration tests for discovery, batch scheduling and the detector lifecycle
//!
//! Engines are in-process fakes: bright images score as AI, dark ones do not.

use futures::future::{BoxFuture, FutureExt};
use neurocheck::bridge::{build_bridge, DirectBridge, InferenceBridge, InferenceEngine};
use neurocheck::config::{BridgeConfig, Config, FilterConfig, SchedulerConfig};
use neurocheck::{
    BatchScheduler, Detector, DetectorError, DetectorStatus, Discovery, Document, Fragment,
    ImageElement, ImageState, InMemorySettings, MemorySurface, Result, Settings, Tensor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

struct BrightnessEngine {
    runs: AtomicUsize,
    fail_init: bool,
}

impl BrightnessEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            fail_init: false,
        })
    }
}

impl InferenceEngine for BrightnessEngine {
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

    fn run(&self, input: Tensor) -> BoxFuture<'_, Result<Tensor>> {
        async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let mean = input.data().iter().sum::<f32>() / input.len().max(1) as f32;
            // Two-class logits: [real, ai]
            let logits = if mean > 0.5 { vec![-2.0, 2.0] } else { vec![2.0, -2.0] };
            Tensor::new(vec![1, 2], logits)
        }
        .boxed()
    }
}

fn image(width: u32, height: u32, shade: u8) -> ImageElement {
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for _ in 0..width * height {
        pixels.extend_from_slice(&[shade, shade, shade, 255]);
    }
    ImageElement::raster(format!("mem://{}x{}-{}", width, height, shade), width, height, pixels)
}

fn fast_config() -> Config {
    Config {
        scheduler: SchedulerConfig {
            batch_interval: Duration::from_millis(20),
            ..Default::default()
        },
        bridge: BridgeConfig {
            init_retry_delay: Duration::from_millis(1),
            ..Default::default()
        },
        isolated_engine: false,
        ..Default::default()
    }
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_eligibility_through_discovery() {
    let doc = Arc::new(Document::new());
    let small = doc.append_image(Document::ROOT, image(149, 300, 200)).unwrap();
    let ok = doc.append_image(Document::ROOT, image(300, 300, 200)).unwrap();
    let large = doc.append_image(Document::ROOT, image(1025, 300, 200)).unwrap();

    let discovery = Discovery::new(doc, FilterConfig::default());
    let eligible = discovery.scan(Document::ROOT);

    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].node(), ok);
    assert_eq!(
        discovery.handle(small).unwrap().state(),
        ImageState::Skipped(neurocheck::SkipReason::TooSmall)
    );
    assert_eq!(
        discovery.handle(large).unwrap().state(),
        ImageState::Skipped(neurocheck::SkipReason::TooLarge)
    );
}

#[tokio::test]
async fn test_twenty_images_run_as_eight_eight_four_in_order() {
    let doc = Arc::new(Document::new());
    for i in 0..20u8 {
        doc.append_image(Document::ROOT, image(150, 150, i * 10)).unwrap();
    }
    let discovery = Discovery::new(Arc::clone(&doc), FilterConfig::default());
    let eligible = discovery.scan(Document::ROOT);
    let expected_order: Vec<_> = eligible.iter().map(|h| h.node()).collect();
    assert_eq!(expected_order.len(), 20);

    let engine = BrightnessEngine::new();
    let bridge = Arc::new(DirectBridge::new(engine.clone(), &BridgeConfig::default()));
    bridge.initialize().await.unwrap();
    let surface = Arc::new(MemorySurface::new());
    let scheduler = Arc::new(BatchScheduler::new(
        bridge,
        surface.clone(),
        SchedulerConfig {
            batch_interval: Duration::from_millis(30),
            ..Default::default()
        },
    ));

    let mut reports = scheduler.subscribe_reports();
    assert_eq!(scheduler.enqueue_all(eligible), 20);

    let mut sizes = Vec::new();
    let mut processed = Vec::new();
    for _ in 0..3 {
        let report = timeout(Duration::from_secs(3), reports.recv()).await.unwrap().unwrap();
        sizes.push(report.processed.len());
        processed.extend(report.processed);
    }

    assert_eq!(sizes, vec![8, 8, 4]);
    assert_eq!(processed, expected_order);
    assert_eq!(surface.classified_count(), 20);
    // Warm-up plus one run per image
    assert_eq!(engine.runs.load(Ordering::SeqCst), 21);
}

#[tokio::test]
async fn test_detector_classifies_initial_and_inserted_images() {
    let doc = Arc::new(Document::new());
    let bright = doc.append_image(Document::ROOT, image(300, 300, 230)).unwrap();
    let dark = doc.append_image(Document::ROOT, image(300, 200, 20)).unwrap();
    let tiny = doc.append_image(Document::ROOT, image(32, 32, 230)).unwrap();

    let engine = BrightnessEngine::new();
    let config = fast_config();
    let bridge = build_bridge(engine, &config.bridge, config.isolated_engine);
    let surface = Arc::new(MemorySurface::new());
    let settings = Arc::new(InMemorySettings::default());

    let detector = Detector::new(config, Arc::clone(&doc), bridge, settings, surface.clone());
    assert_eq!(detector.start().await.unwrap(), DetectorStatus::Running);

    timeout(Duration::from_secs(3), detector.wait_idle()).await.unwrap();
    assert!(surface.classification(bright).unwrap().is_ai);
    assert!(!surface.classification(dark).unwrap().is_ai);
    assert!(surface.classification(tiny).is_none());

    // Images arriving later are picked up by the observer
    let section = doc
        .append_fragment(
            Document::ROOT,
            Fragment {
                images: vec![image(400, 400, 240)],
                children: Vec::new(),
            },
        )
        .unwrap();
    let inserted = doc.images_under(section)[0];
    eventually(|| surface.classification(inserted).is_some()).await;

    // Deferred until the load completes
    let late = doc.append_image(Document::ROOT, ImageElement::pending("mem://late")).unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(surface.classification(late).is_none());
    let loaded = image(200, 200, 250);
    doc.complete_load(late, 200, 200, loaded.pixels.unwrap().to_vec()).unwrap();
    eventually(|| surface.classification(late).is_some()).await;

    detector.shutdown();
}

#[tokio::test]
async fn test_detector_with_isolated_engine() {
    let doc = Arc::new(Document::new());
    let node = doc.append_image(Document::ROOT, image(256, 256, 250)).unwrap();

    let config = Config {
        isolated_engine: true,
        ..fast_config()
    };
    let bridge = build_bridge(BrightnessEngine::new(), &config.bridge, config.isolated_engine);
    let surface = Arc::new(MemorySurface::new());

    let detector = Detector::new(config, doc, bridge, Arc::new(InMemorySettings::default()), surface.clone());
    detector.start().await.unwrap();
    timeout(Duration::from_secs(3), detector.wait_idle()).await.unwrap();

    let score = surface.classification(node).unwrap();
    assert!(score.is_ai);
    assert!((score.probability - 0.98201376).abs() < 1e-5);
    detector.shutdown();
}

#[tokio::test]
async fn test_explain_only_for_positive_images() {
    let doc = Arc::new(Document::new());
    let bright = doc.append_image(Document::ROOT, image(320, 180, 240)).unwrap();
    let dark = doc.append_image(Document::ROOT, image(320, 180, 10)).unwrap();

    let config = fast_config();
    let bridge = build_bridge(BrightnessEngine::new(), &config.bridge, config.isolated_engine);
    let surface = Arc::new(MemorySurface::new());
    let detector = Detector::new(config, doc, bridge, Arc::new(InMemorySettings::default()), surface.clone());
    detector.start().await.unwrap();
    timeout(Duration::from_secs(3), detector.wait_idle()).await.unwrap();

    let positive = detector.discovery().handle(bright).unwrap();
    assert!(positive.is_saliency_ready());
    let overlay = detector.explain(&positive).await.unwrap();
    assert_eq!((overlay.width, overlay.height), (320, 180));
    assert_eq!(overlay.image.dimensions(), (320, 180));
    assert_eq!(overlay.heatmap.len(), 320 * 180);
    assert!(surface.overlay(bright).is_some());

    // Same content is served from the cache
    let again = detector.explain(&positive).await.unwrap();
    assert!(Arc::ptr_eq(&overlay, &again));

    let negative = detector.discovery().handle(dark).unwrap();
    let refused = detector.explain(&negative).await;
    assert!(matches!(refused, Err(DetectorError::InvalidInput(_))));
    detector.shutdown();
}

#[tokio::test]
async fn test_disable_and_reenable_through_settings() {
    let doc = Arc::new(Document::new());
    let node = doc.append_image(Document::ROOT, image(300, 300, 240)).unwrap();

    let engine = BrightnessEngine::new();
    let config = fast_config();
    let bridge = build_bridge(engine.clone(), &config.bridge, config.isolated_engine);
    let surface = Arc::new(MemorySurface::new());
    let settings = Arc::new(InMemorySettings::default());
    let detector = Detector::new(config, doc, bridge, settings.clone(), surface.clone());

    detector.start().await.unwrap();
    timeout(Duration::from_secs(3), detector.wait_idle()).await.unwrap();
    assert!(surface.classification(node).is_some());

    settings.set_enabled(false);
    eventually(|| !detector.is_running()).await;
    assert!(surface.classification(node).is_none());
    assert!(detector.discovery().handles().is_empty());

    settings.set_enabled(true);
    eventually(|| surface.classification(node).is_some()).await;
    // Warm-up plus the first and the post-rescan classification
    assert_eq!(engine.runs.load(Ordering::SeqCst), 3);
    detector.shutdown();
}

#[tokio::test]
async fn test_start_paused_when_disabled() {
    let doc = Arc::new(Document::new());
    let node = doc.append_image(Document::ROOT, image(300, 300, 240)).unwrap();

    let config = fast_config();
    let bridge = build_bridge(BrightnessEngine::new(), &config.bridge, config.isolated_engine);
    let surface = Arc::new(MemorySurface::new());
    let settings = Arc::new(InMemorySettings::new(Settings {
        enabled: false,
        ..Default::default()
    }));
    let detector = Detector::new(config, doc, bridge, settings.clone(), surface.clone());

    assert_eq!(detector.start().await.unwrap(), DetectorStatus::Paused);
    sleep(Duration::from_millis(60)).await;
    assert!(surface.classification(node).is_none());

    settings.set_enabled(true);
    eventually(|| surface.classification(node).is_some()).await;
    detector.shutdown();
}

#[tokio::test]
async fn test_blacklisted_page_is_skipped() {
    let config = Config {
        page_url: Some("https://www.youtube.com/watch?v=abc".into()),
        ..fast_config()
    };
    let engine = BrightnessEngine::new();
    let bridge = build_bridge(engine.clone(), &config.bridge, config.isolated_engine);
    let detector = Detector::new(
        config,
        Arc::new(Document::new()),
        bridge,
        Arc::new(InMemorySettings::default()),
        Arc::new(MemorySurface::new()),
    );

    assert_eq!(detector.start().await.unwrap(), DetectorStatus::Skipped);
    assert_eq!(engine.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_init_failure_disables_pipeline() {
    let doc = Arc::new(Document::new());
    doc.append_image(Document::ROOT, image(300, 300, 240)).unwrap();

    let engine = Arc::new(BrightnessEngine {
        runs: AtomicUsize::new(0),
        fail_init: true,
    });
    let config = Config {
        bridge: BridgeConfig {
            init_attempts: 2,
            init_retry_delay: Duration::from_millis(1),
            ..Default::default()
        },
        ..fast_config()
    };
    let bridge = build_bridge(engine.clone(), &config.bridge, config.isolated_engine);
    let surface = Arc::new(MemorySurface::new());
    let detector = Detector::new(config, doc, bridge, Arc::new(InMemorySettings::default()), surface.clone());

    let result = detector.start().await;
    assert!(matches!(result, Err(DetectorError::InitFailed(_))));
    assert!(!detector.is_running());

    sleep(Duration::from_millis(60)).await;
    assert_eq!(surface.classified_count(), 0);
    assert_eq!(engine.runs.load(Ordering::SeqCst), 0);
}
