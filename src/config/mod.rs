//! Deployment configuration with TOML support
//!
//! Gateway and worker configuration with file loading, environment
//! variable overrides, and validation. CLI flags (parsed in the binaries)
//! take precedence over everything here.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::batching::CoalescerConfig;
use crate::utils::error::{MeshError, Result};

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Worker endpoints, including scheme (e.g. `http://localhost:8001`)
    pub workers: Vec<String>,

    /// Per-forward round-trip timeout
    pub forward_timeout_ms: u64,

    /// Enable CORS (allow cross-origin requests)
    pub enable_cors: bool,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            workers: vec![
                "http://localhost:8001".to_string(),
                "http://localhost:8002".to_string(),
                "http://localhost:8003".to_string(),
            ],
            forward_timeout_ms: 10_000,
            enable_cors: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from `INFERMESH_CONFIG` (if set) with env overrides applied.
    pub fn load() -> Self {
        let mut config = load_from_env_path::<Self>();
        config.apply_env_overrides();
        config
    }

    pub fn from_file(path: &str) -> Result<Self> {
        from_file(path)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("INFERMESH_HOST") {
            self.host = host;
        }
        if let Some(port) = env_parse("INFERMESH_PORT") {
            self.port = port;
        }
        if let Ok(workers) = std::env::var("INFERMESH_WORKERS") {
            self.workers = workers
                .split(',')
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty())
                .collect();
        }
        if let Some(timeout) = env_parse("FORWARD_TIMEOUT_MS") {
            self.forward_timeout_ms = timeout;
        }
        self.logging.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(MeshError::Config("port cannot be 0".to_string()));
        }
        if self.workers.is_empty() {
            return Err(MeshError::Config(
                "at least one worker endpoint is required".to_string(),
            ));
        }
        self.logging.validate()
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Stable worker identity; defaults to `worker_<port>` when unset
    pub node_id: Option<String>,

    /// Model identifier reported in responses and logs
    pub model_name: String,

    /// Enable CORS (allow cross-origin requests)
    pub enable_cors: bool,

    /// Batching behavior
    pub batch: BatchSettings,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            node_id: None,
            model_name: "resnet50".to_string(),
            enable_cors: false,
            batch: BatchSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from `INFERMESH_CONFIG` (if set) with env overrides applied.
    pub fn load() -> Self {
        let mut config = load_from_env_path::<Self>();
        config.apply_env_overrides();
        config
    }

    pub fn from_file(path: &str) -> Result<Self> {
        from_file(path)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("INFERMESH_HOST") {
            self.host = host;
        }
        if let Some(port) = env_parse("INFERMESH_PORT") {
            self.port = port;
        }
        if let Ok(node_id) = std::env::var("INFERMESH_NODE_ID") {
            self.node_id = Some(node_id);
        }
        if let Some(size) = env_parse("MAX_BATCH_SIZE") {
            self.batch.max_batch_size = size;
        }
        if let Some(timeout) = env_parse("BATCH_TIMEOUT_MS") {
            self.batch.timeout_ms = timeout;
        }
        if let Some(capacity) = env_parse("MAX_QUEUE_SIZE") {
            self.batch.queue_capacity = capacity;
        }
        self.logging.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(MeshError::Config("port cannot be 0".to_string()));
        }
        self.batch.to_coalescer_config().validate()?;
        self.logging.validate()
    }

    /// Effective worker identity.
    pub fn node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| format!("worker_{}", self.port))
    }
}

/// Batching knobs, mirroring [`CoalescerConfig`] in wire-friendly units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Hard upper bound on batch length
    pub max_batch_size: usize,

    /// Batch window after the first request arrives
    pub timeout_ms: u64,

    /// How long a caller waits for its response
    pub submit_timeout_ms: u64,

    /// Ingress queue capacity
    pub queue_capacity: usize,

    /// How long shutdown waits for the dispatch task
    pub join_timeout_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            timeout_ms: 20,
            submit_timeout_ms: 10_000,
            queue_capacity: 1024,
            join_timeout_ms: 2_000,
        }
    }
}

impl BatchSettings {
    pub fn to_coalescer_config(&self) -> CoalescerConfig {
        CoalescerConfig {
            max_batch_size: self.max_batch_size,
            batch_timeout: Duration::from_millis(self.timeout_ms),
            submit_timeout: Duration::from_millis(self.submit_timeout_ms),
            queue_capacity: self.queue_capacity,
            join_timeout: Duration::from_millis(self.join_timeout_ms),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for this crate (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("INFERMESH_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(format) = std::env::var("INFERMESH_LOG_FORMAT") {
            self.format = format;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !["trace", "debug", "info", "warn", "error"].contains(&self.level.as_str()) {
            return Err(MeshError::Config(format!(
                "unknown log level: {}",
                self.level
            )));
        }
        if !["pretty", "json"].contains(&self.format.as_str()) {
            return Err(MeshError::Config(format!(
                "unknown log format: {}",
                self.format
            )));
        }
        Ok(())
    }

    /// Install the global tracing subscriber. `RUST_LOG` still wins over the
    /// configured level when set.
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!("infermesh={}", self.level))
        });
        let registry = tracing_subscriber::registry().with(filter);
        if self.format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

fn from_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| MeshError::Config(format!("failed to read {}: {}", path, e)))?;
    toml::from_str(&contents)
        .map_err(|e| MeshError::Config(format!("failed to parse {}: {}", path, e)))
}

fn load_from_env_path<T>() -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    if let Ok(path) = std::env::var("INFERMESH_CONFIG") {
        match from_file(&path) {
            Ok(config) => {
                info!("loaded config from {}", path);
                config
            }
            Err(e) => {
                warn!("failed to load config: {}, using defaults", e);
                T::default()
            }
        }
    } else {
        T::default()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
