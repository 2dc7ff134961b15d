//! # Configuration Module
//!
//! Configuration for the mediasort daemon: HTTP server binding, scheduler
//! tuning knobs, pipeline settings, and the worker population. Loaded from
//! a TOML file, adjusted by `MEDIASORT_*` environment variables, then
//! validated before any component starts.
//!
//! ## Overview
//!
//! Every tuning knob of the core has a configuration field with the
//! documented default:
//!
//! | knob | field | default |
//! |------|-------|---------|
//! | fast queue concurrency | `scheduler.fast_concurrency` | 32 |
//! | background queue concurrency | `scheduler.background_concurrency` | 8 |
//! | fast-vs-background threshold | `scheduler.fast_threshold` | 1000 ms |
//! | min samples for measured classification | `scheduler.min_samples` | 10 |
//! | default callback timeout | `scheduler.callback_timeout` | 60 s |
//! | dispatch timeout | `scheduler.dispatch_timeout` | 10 s |
//! | dependency wait timeout | `scheduler.dependency_timeout` | 30 s |
//! | drain poll interval | `scheduler.drain_poll` | 500 ms |
//! | change batch interval | `pipeline.batch_interval` | 5 s |
//! | max retries per file | `pipeline.max_retries` | 10 |
//! | fast phase retry cap | `pipeline.fast_retry_cap` | 10 m |
//! | full-hash phase retry cap | `pipeline.background_retry_cap` | 4 h |
//! | health probe interval | `workers.health_interval` | 30 s |
//! | health probe timeout | `workers.health_timeout` | 5 s |
//! | startup health wait | `workers.startup_timeout` | 30 s |
//!
//! ## Example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3000
//! timeout = "30s"
//!
//! [scheduler]
//! fast_concurrency = 32
//! background_concurrency = 8
//!
//! [pipeline]
//! extensions = ["mkv", "mp4", "flac", "jpg"]
//!
//! [workers]
//! network = "mediasort"
//! callback_url = "http://core:3000/api/plugins/callback"
//!
//! [[workers.plugins]]
//! id = "ffprobe"
//! image = "mediasort/plugin-ffprobe:1"
//! instances = 2
//! ```

use mediasort_worker_sdk::common::duration_serde;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Main configuration for the mediasort daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration settings
    pub server: ServerConfig,
    /// Scheduler tuning knobs
    pub scheduler: SchedulerConfig,
    /// Streaming pipeline settings
    pub pipeline: PipelineConfig,
    /// Worker population and health settings
    pub workers: WorkersConfig,
    /// Logging configuration (level, format, output)
    pub logging: LoggingConfig,
}

/// HTTP server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind the server to
    pub host: String,
    /// Port number to listen on
    pub port: u16,
    /// Request timeout duration
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
        }
    }
}

/// Scheduler tuning knobs. Defaults match the documented core contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether plugin scheduling runs at all. When disabled the pipeline
    /// declares files done itself and the callback ingress answers 503.
    pub enabled: bool,
    /// Concurrent dispatch budget of the fast queue
    pub fast_concurrency: usize,
    /// Concurrent dispatch budget of the background queue
    pub background_concurrency: usize,
    /// Rolling-mean duration below which a plugin is classified fast
    #[serde(with = "duration_serde")]
    pub fast_threshold: Duration,
    /// Completed samples required before measured classification applies
    pub min_samples: usize,
    /// Callback deadline when the manifest does not set one
    #[serde(with = "duration_serde")]
    pub callback_timeout: Duration,
    /// Deadline for the worker to answer `accepted` on /process
    #[serde(with = "duration_serde")]
    pub dispatch_timeout: Duration,
    /// How long a task waits for unsettled dependencies before proceeding
    /// with stale metadata
    #[serde(with = "duration_serde")]
    pub dependency_timeout: Duration,
    /// Poll interval of `wait_for_empty`
    #[serde(with = "duration_serde")]
    pub drain_poll: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_concurrency: 32,
            background_concurrency: 8,
            fast_threshold: Duration::from_millis(1000),
            min_samples: 10,
            callback_timeout: Duration::from_secs(60),
            dispatch_timeout: Duration::from_secs(10),
            dependency_timeout: Duration::from_secs(30),
            drain_poll: Duration::from_millis(500),
        }
    }
}

/// Streaming pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// File extensions admitted by validation, lowercase, without the dot
    pub extensions: Vec<String>,
    /// Concurrency of the validation stage (I/O-bound, high)
    pub validation_concurrency: usize,
    /// Concurrency of the identity-hash fast phase
    pub fast_concurrency: usize,
    /// Concurrency of the full-hash background phase
    pub background_concurrency: usize,
    /// Flush interval of the batched change notifier
    #[serde(with = "duration_serde")]
    pub batch_interval: Duration,
    /// Maximum retries per file and phase before it lands in the failure log
    pub max_retries: u32,
    /// Base attempt timeout for phase retries
    #[serde(with = "duration_serde")]
    pub base_timeout: Duration,
    /// Ceiling of the escalating fast-phase timeout
    #[serde(with = "duration_serde")]
    pub fast_retry_cap: Duration,
    /// Ceiling of the escalating full-hash timeout
    #[serde(with = "duration_serde")]
    pub background_retry_cap: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            validation_concurrency: 64,
            fast_concurrency: 16,
            background_concurrency: 4,
            batch_interval: Duration::from_secs(5),
            max_retries: 10,
            base_timeout: Duration::from_secs(30),
            fast_retry_cap: Duration::from_secs(10 * 60),
            background_retry_cap: Duration::from_millis(14_400_000),
        }
    }
}

fn default_extensions() -> Vec<String> {
    [
        "mkv", "mp4", "avi", "mov", "webm", "mp3", "flac", "ogg", "wav", "jpg", "jpeg", "png",
        "webp", "gif",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Worker population and health settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Docker network the worker containers join
    pub network: String,
    /// Callback URL advertised to workers in every /process request
    pub callback_url: String,
    /// Base URL of the metadata core advertised to workers
    pub meta_core_url: String,
    /// Interval between health probes
    #[serde(with = "duration_serde")]
    pub health_interval: Duration,
    /// Per-probe timeout
    #[serde(with = "duration_serde")]
    pub health_timeout: Duration,
    /// How long to wait for the first healthy instance of a plugin
    #[serde(with = "duration_serde")]
    pub startup_timeout: Duration,
    /// Configured plugins
    pub plugins: Vec<PluginSpec>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            network: "mediasort".to_string(),
            callback_url: "http://127.0.0.1:3000/api/plugins/callback".to_string(),
            meta_core_url: "http://127.0.0.1:3000".to_string(),
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(30),
            plugins: Vec::new(),
        }
    }
}

/// One configured plugin.
///
/// Either `image` (container runtime spawns replicas) or `endpoints`
/// (externally managed instances, used by the static runtime) must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Plugin id; must match the manifest the worker serves
    pub id: String,
    /// Container image to spawn instances from
    #[serde(default)]
    pub image: Option<String>,
    /// Pre-existing instance base URLs (static runtime)
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Replica count override; the manifest's `instances` wins when absent
    #[serde(default)]
    pub instances: Option<u32>,
    /// Persisted configuration pushed to every instance after spawn
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    /// Extra environment variables handed to the container runtime
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Available log output formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for structured logging
    Json,
    /// Human-readable pretty format
    Pretty,
    /// Compact single-line format
    Compact,
}

impl Config {
    /// Load configuration from a TOML file, apply environment overrides,
    /// and validate.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration constraints.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("server host cannot be empty"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server port must be between 1 and 65535"));
        }
        if self.server.max_body_size == 0 {
            return Err(anyhow::anyhow!("max body size cannot be 0"));
        }
        if self.scheduler.fast_concurrency == 0 || self.scheduler.background_concurrency == 0 {
            return Err(anyhow::anyhow!("queue concurrency cannot be 0"));
        }
        if self.scheduler.drain_poll.is_zero() {
            return Err(anyhow::anyhow!("drain poll interval cannot be 0"));
        }
        if self.workers.health_interval.is_zero() {
            return Err(anyhow::anyhow!("health probe interval cannot be 0"));
        }
        for plugin in &self.workers.plugins {
            if plugin.id.is_empty() {
                return Err(anyhow::anyhow!("plugin id cannot be empty"));
            }
            if plugin.image.is_none() && plugin.endpoints.is_empty() {
                return Err(anyhow::anyhow!(
                    "plugin {} needs either an image or endpoints",
                    plugin.id
                ));
            }
            for endpoint in &plugin.endpoints {
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    return Err(anyhow::anyhow!(
                        "invalid endpoint for plugin {}: {}",
                        plugin.id,
                        endpoint
                    ));
                }
            }
        }
        Ok(())
    }

    /// Apply `MEDIASORT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("MEDIASORT_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port_str) = env::var("MEDIASORT_PORT") {
            let port: u16 = port_str
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid MEDIASORT_PORT: {port_str}"))?;
            if port > 0 {
                self.server.port = port;
            }
        }
        if let Ok(level) = env::var("MEDIASORT_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(value) = env::var("MEDIASORT_FAST_CONCURRENCY") {
            self.scheduler.fast_concurrency = value
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid MEDIASORT_FAST_CONCURRENCY: {value}"))?;
        }
        if let Ok(value) = env::var("MEDIASORT_BACKGROUND_CONCURRENCY") {
            self.scheduler.background_concurrency = value.parse().map_err(|_| {
                anyhow::anyhow!("invalid MEDIASORT_BACKGROUND_CONCURRENCY: {value}")
            })?;
        }
        if let Ok(value) = env::var("MEDIASORT_FAST_THRESHOLD") {
            self.scheduler.fast_threshold = parse_duration(&value)?;
        }
        if let Ok(value) = env::var("MEDIASORT_CALLBACK_TIMEOUT") {
            self.scheduler.callback_timeout = parse_duration(&value)?;
        }
        if let Ok(value) = env::var("MEDIASORT_DISPATCH_TIMEOUT") {
            self.scheduler.dispatch_timeout = parse_duration(&value)?;
        }
        if let Ok(value) = env::var("MEDIASORT_DEPENDENCY_TIMEOUT") {
            self.scheduler.dependency_timeout = parse_duration(&value)?;
        }
        if let Ok(value) = env::var("MEDIASORT_BATCH_INTERVAL") {
            self.pipeline.batch_interval = parse_duration(&value)?;
        }
        if let Ok(value) = env::var("MEDIASORT_CALLBACK_URL") {
            if !value.is_empty() {
                self.workers.callback_url = value;
            }
        }
        Ok(())
    }
}

/// Parse a human-readable duration string ("500ms", "30s", "1m", "2h").
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    duration_serde::parse_duration_string(s).map_err(|e| anyhow::anyhow!(e))
}
