//! Configuration types for drive-fetch

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Download behavior configuration (storage roots, parallelism, progress reporting)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Root of the evictable cache tier; block files live here too (default: "./cache")
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Root of the durable tier for offline files (default: "./offline")
    #[serde(default = "default_permanent_dir")]
    pub permanent_dir: PathBuf,

    /// Number of concurrent block transfers per download (default: 4)
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Interval between progress emissions (default: 250ms)
    #[serde(default = "default_progress_interval", with = "duration_millis_serde")]
    pub progress_interval: Duration,

    /// Timeout for a single block request (default: 60 seconds)
    #[serde(default = "default_http_timeout", with = "duration_serde")]
    pub http_timeout: Duration,

    /// Capacity of the event broadcast channel (default: 1000)
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            permanent_dir: default_permanent_dir(),
            parallelism: default_parallelism(),
            progress_interval: default_progress_interval(),
            http_timeout: default_http_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./drive-fetch.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for [`FileDownloader`](crate::FileDownloader)
///
/// Threaded explicitly into every component at construction; nothing reads
/// process-global settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Data storage settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Retry policy for remote metadata lookups
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Cache tier root
    pub fn cache_dir(&self) -> &PathBuf {
        &self.download.cache_dir
    }

    /// Permanent tier root
    pub fn permanent_dir(&self) -> &PathBuf {
        &self.download.permanent_dir
    }

    /// Reject settings that can never work
    pub fn validate(&self) -> Result<()> {
        if self.download.parallelism == 0 {
            return Err(Error::Config {
                message: "parallelism must be at least 1".to_string(),
                key: Some("parallelism".to_string()),
            });
        }
        if self.download.cache_dir == self.download.permanent_dir {
            return Err(Error::Config {
                message: "cache and permanent directories must differ".to_string(),
                key: Some("permanent_dir".to_string()),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config {
                message: "max_attempts must be at least 1".to_string(),
                key: Some("max_attempts".to_string()),
            });
        }
        Ok(())
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_permanent_dir() -> PathBuf {
    PathBuf::from("offline")
}

fn default_parallelism() -> usize {
    4
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_event_buffer() -> usize {
    1000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("drive-fetch.db")
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
