//! Service configuration
//!
//! Every knob can be set by flag or environment variable (a `.env` file is
//! loaded first). The supervisor hands the resolved config to its workers as
//! JSON in [`WORKER_CONFIG_ENV`].

use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable carrying the serialized config into worker processes
pub const WORKER_CONFIG_ENV: &str = "THERMO_MEDIA_WORKER_CONFIG";

pub const DEFAULT_ALLOWED_TYPES: &str = "image/png,image/jpeg,image/webp,image/bmp,image/gif,image/tiff,\
video/mp4,video/x-msvideo,video/quicktime,video/x-matroska,video/x-flv";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{0} must be between 0 and 1")]
    OutOfRange(&'static str),

    #[error("allowed content types must not be empty")]
    EmptyAllowList,

    #[error("invalid worker config: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("worker config missing from environment ({0})")]
    Missing(&'static str),
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listening port
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Number of worker processes
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Request slots per worker process
    #[arg(long, env = "THREADS", default_value_t = 4)]
    pub threads: usize,

    /// Hard per-request timeout; overrunning workers are killed
    #[arg(long = "timeout-secs", env = "REQUEST_TIMEOUT_SECS", default_value_t = 90)]
    pub timeout_secs: u64,

    /// Longest a client may take to deliver the request body; never longer
    /// than the request timeout
    #[arg(long = "body-timeout-secs", env = "BODY_TIMEOUT_SECS", default_value_t = 30)]
    pub body_timeout_secs: u64,

    /// Maximum accepted payload size in bytes (inclusive)
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 64 * 1024 * 1024)]
    pub max_upload_bytes: u64,

    /// Comma separated allow-list of declared content types
    #[arg(long, env = "ALLOWED_TYPES", value_delimiter = ',', default_value = DEFAULT_ALLOWED_TYPES)]
    pub allowed_types: Vec<String>,

    #[arg(long, env = "UPLOADS_DIR", default_value = "uploads")]
    pub uploads_dir: PathBuf,

    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Listen backlog per worker socket; connections past it are refused
    #[arg(long, env = "BACKLOG", default_value_t = 64)]
    pub backlog: i32,

    /// Stage plan used when a request names none
    #[arg(long, env = "DEFAULT_STAGES", default_value = "identity")]
    pub default_stages: String,

    /// Smoothed heatmap density above which a frame counts as over threshold
    #[arg(long, env = "DENSITY_THRESHOLD", default_value_t = 0.45)]
    pub density_threshold: f32,

    #[arg(long = "reap-interval-secs", env = "REAP_INTERVAL_SECS", default_value_t = 60)]
    pub reap_interval_secs: u64,

    /// Extra age beyond the request timeout before a transient file counts as orphaned
    #[arg(long = "reap-grace-secs", env = "REAP_GRACE_SECS", default_value_t = 10)]
    pub reap_grace_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            workers: 2,
            threads: 4,
            timeout_secs: 90,
            body_timeout_secs: 30,
            max_upload_bytes: 64 * 1024 * 1024,
            allowed_types: DEFAULT_ALLOWED_TYPES.split(',').map(str::to_string).collect(),
            uploads_dir: PathBuf::from("uploads"),
            data_dir: PathBuf::from("data"),
            backlog: 64,
            default_stages: "identity".to_string(),
            density_threshold: 0.45,
            reap_interval_secs: 60,
            reap_grace_secs: 10,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        if self.threads == 0 {
            return Err(ConfigError::Zero("threads"));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Zero("timeout"));
        }
        if self.body_timeout_secs == 0 {
            return Err(ConfigError::Zero("body timeout"));
        }
        if !(0.0..=1.0).contains(&self.density_threshold) {
            return Err(ConfigError::OutOfRange("density threshold"));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Zero("max upload size"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Zero("backlog"));
        }
        if self.allowed_types.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::EmptyAllowList);
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn body_timeout(&self) -> Duration {
        Duration::from_secs(self.body_timeout_secs.min(self.timeout_secs))
    }

    /// Total concurrent requests across the pool
    pub fn capacity(&self) -> usize {
        self.workers * self.threads
    }

    /// Age past which a transient file cannot belong to a live request
    pub fn orphan_age(&self) -> Duration {
        Duration::from_secs(self.timeout_secs + self.reap_grace_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Allow-list lookup, case-insensitive and ignoring MIME parameters
    pub fn is_type_allowed(&self, declared: &str) -> bool {
        let essence = declared.split(';').next().unwrap_or("").trim();
        self.allowed_types
            .iter()
            .any(|t| t.trim().eq_ignore_ascii_case(essence))
    }

    pub fn to_env_value(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_env_value(value: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_worker_env() -> Result<Self, ConfigError> {
        let value = std::env::var(WORKER_CONFIG_ENV).map_err(|_| ConfigError::Missing(WORKER_CONFIG_ENV))?;
        Self::from_env_value(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity(), 8);
        assert_eq!(config.timeout(), Duration::from_secs(90));
        assert_eq!(config.orphan_age(), Duration::from_secs(100));
    }

    #[test]
    fn test_rejects_zero_pool() {
        let config = ServiceConfig {
            workers: 0,
            ..ServiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("workers"))));

        let config = ServiceConfig {
            allowed_types: vec![" ".to_string()],
            ..ServiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyAllowList)));

        let config = ServiceConfig {
            density_threshold: 1.5,
            ..ServiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange(_))));
    }

    #[test]
    fn test_body_timeout_never_exceeds_request_timeout() {
        let config = ServiceConfig {
            timeout_secs: 5,
            ..ServiceConfig::default()
        };
        assert_eq!(config.body_timeout(), Duration::from_secs(5));
        assert_eq!(ServiceConfig::default().body_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_allow_list_ignores_parameters_and_case() {
        let config = ServiceConfig::default();
        assert!(config.is_type_allowed("image/PNG"));
        assert!(config.is_type_allowed("image/jpeg; charset=binary"));
        assert!(!config.is_type_allowed("application/pdf"));
    }

    #[test]
    fn test_env_value_round_trip() {
        let config = ServiceConfig {
            port: 6123,
            threads: 3,
            ..ServiceConfig::default()
        };
        let restored = ServiceConfig::from_env_value(&config.to_env_value().unwrap()).unwrap();
        assert_eq!(restored.port, 6123);
        assert_eq!(restored.threads, 3);
    }
}
