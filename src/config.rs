//! Configuration for the experiment engine
//!
//! Sensible defaults with `EXPERIMENTS_*` environment overrides. Unparseable
//! values are ignored with a warning and the default is kept.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::constants::{
    DEFAULT_CONFIG_CACHE_TTL_SECS, DEFAULT_HIGH_ENGAGEMENT_CONTENT,
    DEFAULT_HIGH_ENGAGEMENT_REVIEWS, DEFAULT_MAX_CAS_RETRIES, DEFAULT_POWER_ALPHA,
};
use crate::experiment::user::SegmentThresholds;
use crate::storage::WriteMode;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// RocksDB directory (default: ./experiments_data)
    pub storage_path: PathBuf,

    /// Write durability for the RocksDB store (default: async)
    pub write_mode: WriteMode,

    /// Lifetime of cached merged variant configs (default: 300s)
    pub cache_ttl: Duration,

    /// Compare-and-swap attempts per metric observation (default: 16)
    pub max_cas_retries: u32,

    /// Volume thresholds for the high_engagement segment
    pub segment_thresholds: SegmentThresholds,

    /// Significance level for power calculations (default: 0.05)
    pub power_alpha: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./experiments_data"),
            write_mode: WriteMode::Async,
            cache_ttl: Duration::from_secs(DEFAULT_CONFIG_CACHE_TTL_SECS),
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
            segment_thresholds: SegmentThresholds {
                high_engagement_content: DEFAULT_HIGH_ENGAGEMENT_CONTENT,
                high_engagement_reviews: DEFAULT_HIGH_ENGAGEMENT_REVIEWS,
            },
            power_alpha: DEFAULT_POWER_ALPHA,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults
    #[allow(clippy::field_reassign_with_default)]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("EXPERIMENTS_STORAGE_PATH") {
            config.storage_path = PathBuf::from(val);
        }

        if let Some(mode) = parse_env::<WriteMode>("EXPERIMENTS_WRITE_MODE") {
            config.write_mode = mode;
        }

        if let Some(secs) = parse_env::<u64>("EXPERIMENTS_CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(secs);
        }

        if let Some(n) = parse_env::<u32>("EXPERIMENTS_MAX_CAS_RETRIES") {
            config.max_cas_retries = n.clamp(1, 1_000);
        }

        if let Some(n) = parse_env::<u64>("EXPERIMENTS_HIGH_ENGAGEMENT_CONTENT") {
            config.segment_thresholds.high_engagement_content = n;
        }

        if let Some(n) = parse_env::<u64>("EXPERIMENTS_HIGH_ENGAGEMENT_REVIEWS") {
            config.segment_thresholds.high_engagement_reviews = n;
        }

        if let Some(alpha) = parse_env::<f64>("EXPERIMENTS_POWER_ALPHA") {
            if alpha > 0.0 && alpha < 1.0 {
                config.power_alpha = alpha;
            } else {
                tracing::warn!(alpha, "EXPERIMENTS_POWER_ALPHA must be in (0, 1), keeping default");
            }
        }

        config
    }

    /// Log the current configuration
    pub fn log(&self) {
        info!("📋 Experiment engine configuration:");
        info!("   Storage: {:?} ({:?} writes)", self.storage_path, self.write_mode);
        info!("   Config cache TTL: {}s", self.cache_ttl.as_secs());
        info!("   Max CAS retries: {}", self.max_cas_retries);
        info!(
            "   High engagement: {} content or {} reviews",
            self.segment_thresholds.high_engagement_content,
            self.segment_thresholds.high_engagement_reviews
        );
        info!("   Power alpha: {}", self.power_alpha);
    }
}

/// Environment variable documentation
pub fn print_env_help() {
    println!("Experiment Engine Configuration Environment Variables:");
    println!();
    println!("  EXPERIMENTS_STORAGE_PATH   - RocksDB directory (default: ./experiments_data)");
    println!("  EXPERIMENTS_WRITE_MODE     - sync or async (default: async)");
    println!("  EXPERIMENTS_CACHE_TTL_SECS - Per-user config cache lifetime (default: 300)");
    println!("  EXPERIMENTS_MAX_CAS_RETRIES - Attempts per metric write under contention (default: 16)");
    println!();
    println!("Segmentation:");
    println!("  EXPERIMENTS_HIGH_ENGAGEMENT_CONTENT - Content items for high_engagement (default: 50)");
    println!("  EXPERIMENTS_HIGH_ENGAGEMENT_REVIEWS - Reviews for high_engagement (default: 200)");
    println!();
    println!("Statistics:");
    println!("  EXPERIMENTS_POWER_ALPHA    - Significance level for power (default: 0.05)");
    println!();
    println!("  RUST_LOG                   - Log level (e.g., info, debug, trace)");
    println!();
}
