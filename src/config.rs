use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::matching::MatchingConfig;
use crate::orchestrator::ProcessError;
use crate::recognition::{RetryPolicy, acrcloud, shazam};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Application configuration loaded from TOML config file.
/// Every field has a default; the config file is optional.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP(S) proxy shared by both recognition backends.
    pub proxy: Option<String>,
    pub primary: PrimaryConfig,
    pub fallback: FallbackConfig,
    pub matching: MatchingConfig,
    pub processing: ProcessingConfig,
    pub output: OutputConfig,
}

/// Shazam-compatible recognition endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrimaryConfig {
    pub endpoint: String,
    /// Total attempts per segment.
    pub max_retries: u32,
    /// Base backoff delay; multiplied by the attempt number.
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            endpoint: shazam::DEFAULT_ENDPOINT.to_string(),
            max_retries: 5,
            retry_delay_ms: 1000,
            timeout_secs: 30,
        }
    }
}

impl PrimaryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// ACRCloud fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub access_key: Option<String>,
    pub access_secret: Option<String>,
    pub host: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            access_key: None,
            access_secret: None,
            host: acrcloud::DEFAULT_HOST.to_string(),
            max_retries: 3,
            retry_delay_ms: 1000,
            timeout_secs: 10,
        }
    }
}

impl FallbackConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Access key and secret, if both are set and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let key = self.access_key.as_deref().filter(|k| !k.is_empty())?;
        let secret = self.access_secret.as_deref().filter(|s| !s.is_empty())?;
        Some((key, secret))
    }
}

/// Segmenting and batching.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub segment_length_ms: u64,
    /// Fixed batch size. None = derive from segment count and parallelism.
    pub batch_size: Option<usize>,
    /// None = available cores.
    pub parallelism: Option<usize>,
    /// Pause between batches to stay under upstream rate limits.
    pub batch_delay_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            segment_length_ms: 12_000,
            batch_size: None,
            parallelism: None,
            batch_delay_ms: 100,
        }
    }
}

impl ProcessingConfig {
    /// Reject settings no run can use.
    pub fn validate(&self) -> Result<(), ProcessError> {
        if self.segment_length_ms == 0 {
            return Err(ProcessError::InvalidConfig("segment length must be positive".into()));
        }
        if self.batch_size == Some(0) {
            return Err(ProcessError::InvalidConfig("batch size must be positive".into()));
        }
        Ok(())
    }

    pub fn segment_seconds(&self) -> f64 {
        self.segment_length_ms as f64 / 1000.0
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Parallelism figure for the batch heuristic: 0/None → available cores.
    pub fn resolve_parallelism(&self) -> usize {
        match self.parallelism {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
        }
    }
}

/// Tracklist rendering.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub show_gaps: bool,
    pub min_gap_segments: usize,
    pub min_gap_duration_secs: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            show_gaps: true,
            min_gap_segments: 5,
            min_gap_duration_secs: 30.0,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/setid/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => match Self::load_from(&path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("{e}. Using defaults.");
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Load an explicit config file; unlike [`AppConfig::load`], errors are returned.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
