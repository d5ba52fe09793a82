use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::settings::DEFAULT_BLACKLIST;
use crate::tensor::OutputInterpretation;

/// Smallest accepted natural width/height in pixels
pub const MIN_IMAGE_SIZE: u32 = 150;
/// Largest accepted natural width/height in pixels
pub const MAX_IMAGE_SIZE: u32 = 1024;
/// Classification input edge length
pub const CLASSIFY_INPUT_SIZE: u32 = 256;
/// Saliency preprocessing input edge length
pub const SALIENCY_INPUT_SIZE: u32 = 224;
/// Decision threshold on the AI probability
pub const AI_THRESHOLD: f32 = 0.70;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model_path: PathBuf,
    pub image_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub page_url: Option<String>,
    pub enabled: bool,
    pub blacklist: Vec<String>,
    /// Host the engine behind the message-passing bridge instead of calling it directly
    pub isolated_engine: bool,
    pub filter: FilterConfig,
    pub scheduler: SchedulerConfig,
    pub bridge: BridgeConfig,
    pub saliency: SaliencyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub min_size: u32,
    pub max_size: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_size: MIN_IMAGE_SIZE,
            max_size: MAX_IMAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_batch_size: usize,
    pub batch_interval: Duration,
    /// Items finishing under this budget are followed by a plain yield only
    pub item_budget: Duration,
    /// Extra pause after an item that overran its budget
    pub idle_delay: Duration,
    pub interpretation: OutputInterpretation,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            batch_interval: Duration::from_millis(500),
            item_budget: Duration::from_millis(50),
            idle_delay: Duration::from_millis(10),
            interpretation: OutputInterpretation::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub init_timeout: Duration,
    pub request_timeout: Duration,
    /// Capacity of the message channel into the engine host
    pub channel_capacity: usize,
    /// Initialization attempts before the pipeline gives up
    pub init_attempts: u32,
    pub init_retry_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            channel_capacity: 64,
            init_attempts: 3,
            init_retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaliencyConfig {
    pub max_concurrent_jobs: usize,
    pub cache_capacity: usize,
    /// Waiters allowed in the admission queue before callers fall back to backoff
    pub max_queued_jobs: usize,
    pub retry_backoff: Duration,
    pub grid_size: usize,
    /// Fixed seed for the attention noise; random per engine when unset
    pub noise_seed: Option<u64>,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            cache_capacity: 50,
            max_queued_jobs: 32,
            retry_backoff: Duration::from_millis(100),
            grid_size: 14,
            noise_seed: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model/model.onnx"),
            image_dir: PathBuf::from("."),
            output_dir: None,
            page_url: None,
            enabled: true,
            blacklist: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            isolated_engine: true,
            filter: FilterConfig::default(),
            scheduler: SchedulerConfig::default(),
            bridge: BridgeConfig::default(),
            saliency: SaliencyConfig::default(),
        }
    }
}

fn env_millis(key: &str, default: u64) -> Duration {
    let ms = env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default);
    Duration::from_millis(ms)
}

impl Config {
    pub fn load() -> Result<Self> {
        let model_path = PathBuf::from(
            env::var("NEUROCHECK_MODEL_PATH").unwrap_or_else(|_| "model/model.onnx".to_string()),
        );

        let image_dir =
            PathBuf::from(env::var("NEUROCHECK_IMAGE_DIR").unwrap_or_else(|_| ".".to_string()));

        let output_dir = env::var("NEUROCHECK_OUTPUT_DIR").ok().map(PathBuf::from);

        let page_url = env::var("NEUROCHECK_PAGE_URL").ok();

        let enabled = env::var("NEUROCHECK_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        // Comma-separated hostnames; falls back to the built-in list
        let blacklist = match env::var("NEUROCHECK_BLACKLIST") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
        };

        let isolated_engine = env::var("NEUROCHECK_ISOLATED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        let max_batch_size = env::var("NEUROCHECK_BATCH_SIZE")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .unwrap_or(8);

        let interpretation = match env::var("NEUROCHECK_OUTPUT_INTERPRETATION") {
            Ok(raw) => raw.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            Err(_) => OutputInterpretation::Auto,
        };

        let max_concurrent_jobs = env::var("NEUROCHECK_MAX_SALIENCY_JOBS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .unwrap_or(2);

        let cache_capacity = env::var("NEUROCHECK_SALIENCY_CACHE")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .unwrap_or(50);

        if max_batch_size == 0 || max_concurrent_jobs == 0 {
            return Err(anyhow::anyhow!(
                "Batch size and saliency job limit must be at least 1"
            ));
        }

        Ok(Self {
            model_path,
            image_dir,
            output_dir,
            page_url,
            enabled,
            blacklist,
            isolated_engine,
            filter: FilterConfig::default(),
            scheduler: SchedulerConfig {
                max_batch_size,
                batch_interval: env_millis("NEUROCHECK_BATCH_INTERVAL_MS", 500),
                interpretation,
                ..Default::default()
            },
            bridge: BridgeConfig {
                request_timeout: env_millis("NEUROCHECK_INFER_TIMEOUT_MS", 10_000),
                ..Default::default()
            },
            saliency: SaliencyConfig {
                max_concurrent_jobs,
                cache_capacity,
                ..Default::default()
            },
        })
    }
}
