//! Environment-based configuration.
//!
//! Embedders construct a [`Config`] directly or load one from `TIDELOG_*`
//! environment variables. Only the data path is required; everything else has
//! a documented default.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

/// Default bound on the writer request channel when `TIDELOG_WRITER_CAPACITY`
/// is not set. Controls backpressure on appenders.
const DEFAULT_WRITER_CAPACITY: usize = 1024;

/// Default broadcast channel capacity when `TIDELOG_BROKER_CAPACITY` is not set.
const DEFAULT_BROKER_CAPACITY: usize = 4096;

/// Default dedup capacity when `TIDELOG_DEDUP_CAPACITY` is not set.
const DEFAULT_DEDUP_CAPACITY: usize = 65536;

/// Default commit-check poll interval when `TIDELOG_CHECK_POLL_MS` is not set.
const DEFAULT_CHECK_POLL_MS: u64 = 10;

/// Default commit-check timeout when `TIDELOG_CHECK_TIMEOUT_MS` is not set.
const DEFAULT_CHECK_TIMEOUT_MS: u64 = 1_000;

/// Configuration for a Tidelog instance.
///
/// # Environment Variables
///
/// | Variable                   | Required | Default  | Description                              |
/// |----------------------------|----------|----------|------------------------------------------|
/// | `TIDELOG_DATA`             | Yes      | --       | Path to the append-only log file         |
/// | `TIDELOG_WRITER_CAPACITY`  | No       | `1024`   | Writer request channel bound             |
/// | `TIDELOG_BROKER_CAPACITY`  | No       | `4096`   | Broadcast channel buffer size            |
/// | `TIDELOG_DEDUP_CAPACITY`   | No       | `65536`  | Max event IDs in the dedup index         |
/// | `TIDELOG_CHECK_POLL_MS`    | No       | `10`     | Commit-check retry poll interval (ms)    |
/// | `TIDELOG_CHECK_TIMEOUT_MS` | No       | `1000`   | Commit-check retry timeout (ms)          |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path to the append-only transaction log file.
    pub data_path: PathBuf,
    /// Bound on the writer request channel.
    pub writer_capacity: usize,
    /// Broadcast channel ring buffer capacity for live subscriptions.
    pub broker_capacity: usize,
    /// Maximum number of event IDs tracked in the dedup index.
    pub dedup_capacity: NonZeroUsize,
    /// Poll interval for the bounded commit-check retry.
    pub check_poll_interval: Duration,
    /// Timeout for the bounded commit-check retry.
    pub check_timeout: Duration,
}

impl Config {
    /// A configuration with all defaults and the given data path.
    pub fn with_data_path(data_path: impl Into<PathBuf>) -> Config {
        Config {
            data_path: data_path.into(),
            writer_capacity: DEFAULT_WRITER_CAPACITY,
            broker_capacity: DEFAULT_BROKER_CAPACITY,
            dedup_capacity: NonZeroUsize::new(DEFAULT_DEDUP_CAPACITY)
                .expect("default dedup capacity is nonzero"),
            check_poll_interval: Duration::from_millis(DEFAULT_CHECK_POLL_MS),
            check_timeout: Duration::from_millis(DEFAULT_CHECK_TIMEOUT_MS),
        }
    }

    /// Parse configuration from `TIDELOG_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `TIDELOG_DATA` is not set, or if
    /// any optional variable is set to a value that does not parse.
    pub fn from_env() -> Result<Config, Error> {
        let data_path = std::env::var("TIDELOG_DATA")
            .map(PathBuf::from)
            .map_err(|_| {
                Error::InvalidArgument("TIDELOG_DATA environment variable is required".to_string())
            })?;

        let mut config = Config::with_data_path(data_path);

        if let Ok(val) = std::env::var("TIDELOG_WRITER_CAPACITY") {
            config.writer_capacity = val.parse().map_err(|e| {
                Error::InvalidArgument(format!("TIDELOG_WRITER_CAPACITY is not a valid usize: {e}"))
            })?;
        }

        if let Ok(val) = std::env::var("TIDELOG_BROKER_CAPACITY") {
            config.broker_capacity = val.parse().map_err(|e| {
                Error::InvalidArgument(format!("TIDELOG_BROKER_CAPACITY is not a valid usize: {e}"))
            })?;
        }

        if let Ok(val) = std::env::var("TIDELOG_DEDUP_CAPACITY") {
            let raw: usize = val.parse().map_err(|e| {
                Error::InvalidArgument(format!("TIDELOG_DEDUP_CAPACITY is not a valid usize: {e}"))
            })?;
            config.dedup_capacity = NonZeroUsize::new(raw).ok_or_else(|| {
                Error::InvalidArgument("TIDELOG_DEDUP_CAPACITY must be nonzero".to_string())
            })?;
        }

        if let Ok(val) = std::env::var("TIDELOG_CHECK_POLL_MS") {
            let ms: u64 = val.parse().map_err(|e| {
                Error::InvalidArgument(format!("TIDELOG_CHECK_POLL_MS is not a valid u64: {e}"))
            })?;
            config.check_poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("TIDELOG_CHECK_TIMEOUT_MS") {
            let ms: u64 = val.parse().map_err(|e| {
                Error::InvalidArgument(format!("TIDELOG_CHECK_TIMEOUT_MS is not a valid u64: {e}"))
            })?;
            config.check_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}
