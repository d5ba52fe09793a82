use anyhow::Result;
use std::sync::Arc;

use neurocheck::bridge::build_bridge;
use neurocheck::config::Config;
use neurocheck::detector::{Detector, DetectorStatus};
use neurocheck::document::Document;
use neurocheck::metrics;
use neurocheck::onnx::OnnxEngine;
use neurocheck::render::LoggingSurface;
use neurocheck::settings::{should_skip, InMemorySettings, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with filters
    tracing_subscriber::fmt()
        .with_env_filter(
            // ONNX Runtime is chatty at info
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,ort=warn")),
        )
        .init();

    tracing::info!("Starting NeuroCheck image detector...");
    metrics::init_metrics();

    let config = Config::load()?;
    tracing::info!(
        model = %config.model_path.display(),
        images = %config.image_dir.display(),
        isolated = config.isolated_engine,
        "Configuration loaded"
    );

    let settings = Arc::new(InMemorySettings::new(Settings::from(&config)));
    if let Some(url) = &config.page_url {
        if should_skip(settings.as_ref(), url) {
            tracing::info!(url = %url, "Skipping detection on this page");
            return Ok(());
        }
    }

    let document = Arc::new(Document::from_directory(&config.image_dir)?);

    let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let engine = Arc::new(OnnxEngine::new(&config.model_path).with_intra_threads(threads));
    let bridge = build_bridge(engine, &config.bridge, config.isolated_engine);
    let surface = Arc::new(LoggingSurface::new(config.output_dir.clone()));

    let detector = Detector::new(config, document, bridge, settings, surface);

    match detector.start().await? {
        DetectorStatus::Running => {}
        status => {
            tracing::info!(?status, "Detector not running, nothing to do");
            return Ok(());
        }
    }

    tokio::select! {
        _ = detector.wait_idle() => {
            tracing::info!("✅ All queued images classified");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping detector");
            detector.shutdown();
            return Ok(());
        }
    }

    // Explain every positive classification
    let positives: Vec<_> = detector
        .discovery()
        .handles()
        .into_iter()
        .filter(|h| h.is_saliency_ready())
        .collect();
    tracing::info!(count = positives.len(), "Generating saliency overlays");

    for handle in &positives {
        if let Err(e) = detector.explain(handle).await {
            tracing::warn!(node = handle.node(), error = %e, "Saliency generation failed");
        }
    }

    detector.shutdown();

    tracing::info!(
        cache_hit_rate = metrics::saliency_hit_rate(),
        "Run complete"
    );
    tracing::info!("Metrics:\n{}", metrics::export_metrics());

    Ok(())
}
