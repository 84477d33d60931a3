//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP route prefixes.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Pipeline sizing.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// User manager configuration.
    #[serde(default)]
    pub user: UserConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Route prefixes for the relay's HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// SSE subscription route; the check-code is appended as a path
    /// segment.
    #[serde(default = "default_communication_path")]
    pub communication: String,

    /// Message publishing route.
    #[serde(default = "default_sender_path")]
    pub sender: String,

    /// User registration route.
    #[serde(default = "default_register_path")]
    pub register: String,

    /// Receive-list update route.
    #[serde(default = "default_update_list_path")]
    pub update_list: String,

    /// Secret-key update route.
    #[serde(default = "default_update_key_path")]
    pub update_key: String,

    /// Root path segment for staged file URLs.
    #[serde(default = "default_file_root")]
    pub file_root: String,
}

/// Pipeline sizing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of message classifiers.
    #[serde(default = "default_classifier_count")]
    pub classifier_count: usize,

    /// Workers per channel group.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Capacity of each group's incoming and sending queues.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Period of the per-group flow log, in seconds. Zero disables it.
    #[serde(default)]
    pub flow_log_secs: u64,
}

/// User manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Shared secret required to register users. Required.
    #[serde(default = "default_secret_key")]
    pub secret_key: String,

    /// Period of the user expiry sweep, in seconds.
    #[serde(default = "default_sweep_secs")]
    pub expire_sweep_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8324)
}

fn default_true() -> bool {
    true
}

fn default_communication_path() -> String {
    "/im/comm".to_string()
}

fn default_sender_path() -> String {
    "/im/send".to_string()
}

fn default_register_path() -> String {
    "/im/register".to_string()
}

fn default_update_list_path() -> String {
    "/im/update-list".to_string()
}

fn default_update_key_path() -> String {
    "/im/update-key".to_string()
}

fn default_file_root() -> String {
    courier_core::DEFAULT_FILE_ROOT.to_string()
}

fn default_classifier_count() -> usize {
    1
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    10
}

fn default_secret_key() -> String {
    std::env::var("COURIER_SECRET_KEY").unwrap_or_default()
}

fn default_sweep_secs() -> u64 {
    600
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            paths: PathsConfig::default(),
            pipeline: PipelineConfig::default(),
            user: UserConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            communication: default_communication_path(),
            sender: default_sender_path(),
            register: default_register_path(),
            update_list: default_update_list_path(),
            update_key: default_update_key_path(),
            file_root: default_file_root(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classifier_count: default_classifier_count(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            flow_log_secs: 0,
        }
    }
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            secret_key: default_secret_key(),
            expire_sweep_secs: default_sweep_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults, then validate.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed,
    /// or if a required option is missing.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                let config = Self::from_file(expanded.as_ref())?;
                config.validate()?;
                return Ok(config);
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check required options. Starting without them is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error naming the missing or invalid option.
    pub fn validate(&self) -> Result<()> {
        if self.user.secret_key.is_empty() {
            bail!("user.secret_key is required (or set COURIER_SECRET_KEY)");
        }
        if self.pipeline.classifier_count < 1 {
            bail!("pipeline.classifier_count must be at least 1");
        }
        if self.paths.file_root.trim_matches('/').is_empty() {
            bail!("paths.file_root must not be empty");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error when host/port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}
