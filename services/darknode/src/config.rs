//! Configuration management for the darknode service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the darknode service.
#[derive(Debug, Clone, Deserialize)]
pub struct DarknodeConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Basic auth credentials; every route is open when absent
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Expiring scratch store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Worker pool configuration
    pub pool: PoolConfig,

    /// Detector model files handed to the workers
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Where the model installer fetches model files from
    #[serde(default)]
    pub models: ModelsConfig,

    /// Video encoder used when a request asks for a recording
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Asset staging configuration
    #[serde(default)]
    pub staging: StagingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prometheus exporter port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Fixed basic auth credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub name: String,
    pub pass: String,
}

/// Scratch directory store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding one sub-directory per staged asset
    #[serde(default = "default_store_root")]
    pub root: PathBuf,

    /// Lifetime of a scratch directory in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Worker executable, launched once per job
    pub command: String,

    /// Extra arguments passed to the worker executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Maximum number of jobs running at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-job timeout in seconds
    #[serde(default = "default_job_timeout")]
    pub timeout_secs: u64,

    /// How often a failed worker launch is retried
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Base delay between launch retries in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Detector model files.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_weights")]
    pub weights: String,

    #[serde(default = "default_cfg")]
    pub cfg: String,

    /// Weights used when a request sets the `tiny` flag
    #[serde(default = "default_tiny_weights")]
    pub tiny_weights: String,

    #[serde(default = "default_tiny_cfg")]
    pub tiny_cfg: String,

    #[serde(default = "default_data")]
    pub data: String,
}

/// Video encoder configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    /// ffmpeg compatible binary
    #[serde(default = "default_encoder_binary")]
    pub binary: String,
}

/// Asset staging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Extensions (without dot) that classify an asset as video
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,

    /// Accept `file://` URLs and absolute paths as sources
    #[serde(default)]
    pub allow_local_files: bool,

    /// Connection timeout for downloads in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-transfer timeout for downloads in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Buffered events per streaming consumer
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for daily rotated log files; console only when absent
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// File name prefix of the rotated log files
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,

    /// Number of rotated files kept
    #[serde(default = "default_log_max_files")]
    pub max_files: usize,
}

/// Model download configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Directory the model files are installed into
    #[serde(default = "default_models_directory")]
    pub directory: PathBuf,

    /// Files to download; the last URL path segment is the file name
    #[serde(default = "default_model_urls")]
    pub urls: Vec<String>,

    /// Connection timeout for downloads in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_store_root() -> PathBuf {
    std::env::temp_dir().join("darknode")
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_concurrency() -> usize {
    2
}
fn default_job_timeout() -> u64 {
    600
}
fn default_retries() -> u32 {
    2
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_weights() -> String {
    "./cfg/yolo.weights".to_string()
}
fn default_cfg() -> String {
    "./cfg/yolo.cfg".to_string()
}
fn default_tiny_weights() -> String {
    "./cfg/tiny-yolo-voc.weights".to_string()
}
fn default_tiny_cfg() -> String {
    "./cfg/tiny-yolo-voc.cfg".to_string()
}
fn default_data() -> String {
    "./cfg/coco.data".to_string()
}
fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}
fn default_video_extensions() -> Vec<String> {
    vec!["mp4".to_string()]
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    300
}
fn default_stream_buffer() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_log_file_prefix() -> String {
    "darknode.log".to_string()
}
fn default_log_max_files() -> usize {
    365
}
fn default_models_directory() -> PathBuf {
    PathBuf::from("./cfg")
}
fn default_model_urls() -> Vec<String> {
    vec![
        "https://github.com/pjreddie/darknet/raw/master/cfg/tiny-yolo-voc.cfg".to_string(),
        "https://pjreddie.com/media/files/tiny-yolo-voc.weights".to_string(),
        "https://pjreddie.com/media/files/yolo.weights".to_string(),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            weights: default_weights(),
            cfg: default_cfg(),
            tiny_weights: default_tiny_weights(),
            tiny_cfg: default_tiny_cfg(),
            data: default_data(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_encoder_binary(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            video_extensions: default_video_extensions(),
            allow_local_files: false,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
            file_prefix: default_log_file_prefix(),
            max_files: default_log_max_files(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            directory: default_models_directory(),
            urls: default_model_urls(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ModelsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl DarknodeConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with DARKNODE_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. DARKNODE__POOL__CONCURRENCY
            .add_source(
                Environment::with_prefix("DARKNODE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("pool.args")
                    .with_list_parse_key("staging.video_extensions")
                    .with_list_parse_key("models.urls")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.pool.command.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "pool.command".to_string(),
            ));
        }

        if self.pool.concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pool.concurrency".to_string(),
                message: "Concurrency must be greater than 0".to_string(),
            });
        }

        if self.pool.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pool.timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.store.ttl_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "store.ttl_secs".to_string(),
                message: "TTL must be greater than 0".to_string(),
            });
        }

        if self.logging.directory.is_some() && self.logging.max_files == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "logging.max_files".to_string(),
                message: "At least one log file must be kept".to_string(),
            });
        }

        if self.store.root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField("store.root".to_string()));
        }

        if self.staging.stream_buffer == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "staging.stream_buffer".to_string(),
                message: "Stream buffer must be greater than 0".to_string(),
            });
        }

        if let Some(auth) = &self.auth {
            if auth.name.is_empty() || auth.pass.is_empty() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "auth".to_string(),
                    message: "Both name and pass are required when auth is set".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl StoreConfig {
    /// Get the scratch directory lifetime as Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl PoolConfig {
    /// Get the per-job timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the base launch retry delay as Duration.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl StagingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
