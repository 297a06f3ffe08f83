use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main application configuration with a strongly-typed queue section
/// and optional logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Scheduler configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
}

/// Configuration consumed by the scheduler core.
///
/// All durations are plain milliseconds so the section can be set from
/// environment variables without a parse layer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Number of worker slots executing tasks concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Admission boundary: queued + running tasks never exceed this.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Per-attempt timeout applied when the caller does not set one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Upper bound for caller-supplied timeouts.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// Retry budget applied when the caller does not set one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Base delay for exponential retry backoff.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Cap for the backoff delay.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Rate-limiter buckets idle longer than this are swept.
    #[serde(default = "default_rate_limiter_idle_ttl_ms")]
    pub rate_limiter_idle_ttl_ms: u64,
    /// Interval between rate-limiter sweeps.
    #[serde(default = "default_rate_limiter_sweep_interval_ms")]
    pub rate_limiter_sweep_interval_ms: u64,
    /// Token refill rate per user, tokens per second.
    #[serde(default = "default_rate_limiter_refill_per_sec")]
    pub rate_limiter_refill_per_sec: f64,
    /// Token bucket capacity per user.
    #[serde(default = "default_rate_limiter_burst")]
    pub rate_limiter_burst: f64,
    /// Terminal lifecycle records are kept this long before purge.
    #[serde(default = "default_lifecycle_terminal_grace_ms")]
    pub lifecycle_terminal_grace_ms: u64,
    /// Deadline used by `shutdown` when the caller does not set one.
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_default_deadline_ms: u64,
    /// Bounded buffer between event producers and the analytics sink.
    #[serde(default = "default_analytics_buffer_capacity")]
    pub analytics_buffer_capacity: usize,
}

fn default_concurrency() -> usize {
    4
}
fn default_max_queue_size() -> usize {
    100
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_timeout_ms() -> u64 {
    300_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_rate_limiter_idle_ttl_ms() -> u64 {
    600_000
}
fn default_rate_limiter_sweep_interval_ms() -> u64 {
    60_000
}
fn default_rate_limiter_refill_per_sec() -> f64 {
    1.0
}
fn default_rate_limiter_burst() -> f64 {
    10.0
}
fn default_lifecycle_terminal_grace_ms() -> u64 {
    60_000
}
fn default_shutdown_deadline_ms() -> u64 {
    30_000
}
fn default_analytics_buffer_capacity() -> usize {
    1024
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_queue_size: default_max_queue_size(),
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            default_max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            rate_limiter_idle_ttl_ms: default_rate_limiter_idle_ttl_ms(),
            rate_limiter_sweep_interval_ms: default_rate_limiter_sweep_interval_ms(),
            rate_limiter_refill_per_sec: default_rate_limiter_refill_per_sec(),
            rate_limiter_burst: default_rate_limiter_burst(),
            lifecycle_terminal_grace_ms: default_lifecycle_terminal_grace_ms(),
            shutdown_default_deadline_ms: default_shutdown_deadline_ms(),
            analytics_buffer_capacity: default_analytics_buffer_capacity(),
        }
    }
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    pub file: String,          // "logs/genqueue.log"
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_size_mb: Option<u64>, // Max size of the file in MB
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/genqueue.log".to_string(),
            file_level: "debug".to_string(),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            logging: Some(default_logging_config()),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // Start from a minimal base where the optional logging section is
        // None, so it stays None unless explicitly provided by YAML/ENV.
        let base = AppConfig {
            queue: QueueConfig::default(),
            logging: None,
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path.as_ref()))
            // Example: GENQUEUE__QUEUE__CONCURRENCY=8 maps to queue.concurrency
            .merge(Env::prefixed("GENQUEUE__").split("__"));

        let config: AppConfig = figment
            .extract()
            .with_context(|| "Failed to extract config from figment".to_string())?;

        Ok(config)
    }

    /// Load configuration from file or create with default values.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => Ok(Self::default()),
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }
}
