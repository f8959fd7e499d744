//! TOML configuration for the analyzer.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working single-node setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "APIWATCH_CONFIG";
/// Environment variable consulted when `rca.api_key` is empty.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
const SYSTEM_CONFIG_PATH: &str = "/etc/apiwatch/apiwatch.toml";
/// One year.
const MAX_SPAN_SECS: u64 = 366 * 86_400;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default)]
    pub windows: WindowConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub rca: RcaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AnalyzerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded analyzer configuration");
        Ok(config.with_api_key_fallback(std::env::var(API_KEY_ENV).ok()))
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `APIWATCH_CONFIG` environment variable.
    /// 2. `/etc/apiwatch/apiwatch.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "APIWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default().with_api_key_fallback(std::env::var(API_KEY_ENV).ok())
    }

    /// Fill an empty `rca.api_key` from `env_key`.
    pub fn with_api_key_fallback(mut self, env_key: Option<String>) -> Self {
        if self.rca.api_key.trim().is_empty() {
            if let Some(key) = env_key.filter(|k| !k.trim().is_empty()) {
                self.rca.api_key = key;
            }
        }
        self
    }

    /// Reject settings that would make detection meaningless.
    pub fn validate(&self) -> Result<()> {
        let w = &self.windows;
        if w.short_secs == 0 || w.medium_secs == 0 || w.long_secs == 0 {
            bail!("window durations must be positive");
        }
        if w.long_secs > MAX_SPAN_SECS || self.scheduler.dedup_window_secs > MAX_SPAN_SECS {
            bail!("window and dedup durations must not exceed {MAX_SPAN_SECS}s");
        }
        if !(w.short_secs <= w.medium_secs && w.medium_secs <= w.long_secs) {
            bail!(
                "windows must satisfy short <= medium <= long (got {}s, {}s, {}s)",
                w.short_secs,
                w.medium_secs,
                w.long_secs
            );
        }

        let d = &self.detection;
        for (name, factor) in [
            ("detection.error_spike.factor", d.error_spike.factor),
            ("detection.latency_regression.p95_factor", d.latency_regression.p95_factor),
            ("detection.traffic_drop.factor", d.traffic_drop.factor),
        ] {
            if !(factor.is_finite() && factor > 0.0) {
                bail!("{name} must be a positive number (got {factor})");
            }
        }
        if !(0.0..=100.0).contains(&d.error_spike.threshold_pct) {
            bail!("detection.error_spike.threshold_pct must be within 0..=100");
        }

        if self.scheduler.interval_secs == 0 || self.scheduler.dedup_window_secs == 0 {
            bail!("scheduler intervals must be positive");
        }
        if self.intake.workers == 0 || self.rca.workers == 0 {
            bail!("worker counts must be positive");
        }
        if self.intake.queue_capacity == 0 || self.rca.queue_capacity == 0 {
            bail!("queue capacities must be positive");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

/// Spans of the three rolling windows kept per endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub short_secs: u64,
    pub medium_secs: u64,
    pub long_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            short_secs: 300,
            medium_secs: 1800,
            long_secs: 86_400,
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub error_spike: ErrorSpikeConfig,
    pub latency_regression: LatencyRegressionConfig,
    pub traffic_drop: TrafficDropConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorSpikeConfig {
    /// Absolute error-rate floor, percent.
    pub threshold_pct: f64,
    /// Multiple of the baseline error rate that must be exceeded.
    pub factor: f64,
    pub min_requests: u64,
}

impl Default for ErrorSpikeConfig {
    fn default() -> Self {
        Self {
            threshold_pct: 10.0,
            factor: 2.0,
            min_requests: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyRegressionConfig {
    pub p95_factor: f64,
    pub min_requests: u64,
}

impl Default for LatencyRegressionConfig {
    fn default() -> Self {
        Self {
            p95_factor: 1.5,
            min_requests: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficDropConfig {
    /// Fires when short-window volume falls below this share of the baseline.
    pub factor: f64,
    pub min_baseline_requests: u64,
}

impl Default for TrafficDropConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            min_baseline_requests: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// Lookback for suppressing duplicate OPEN incidents.
    pub dedup_window_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            dedup_window_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_secs.min(MAX_SPAN_SECS) as i64)
    }
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// HTTP listener for `POST /api/v1/events`.
    pub bind: String,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            workers: 4,
            queue_capacity: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// RCA
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RcaConfig {
    /// Empty disables generation; reports are then recorded as SKIPPED.
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for RcaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            workers: 2,
            queue_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/apiwatch.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
