//! Startup configuration.
//!
//! The host hands the logger its options as JSON (camelCase keys); they are
//! read once per start and never consulted again while running.
//!
//! ```text
//! {
//!   "logdir": "/home/pi/sk-delta-log",
//!   "interval": 3600,
//!   "context": "vessels.self",
//!   "paths": [{ "path": "navigation.*", "period": 1000 }],
//!   "compression": "gzip"
//! }
//! ```

use crate::error::{Error, Result};
use crate::subscription::SubscriptionItem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_INTERVAL_SECS: f64 = 3600.0;
const DEFAULT_CONTEXT: &str = "vessels.self";
const DEFAULT_MAX_CONCURRENT_COMPRESSIONS: usize = 2;
const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// How rotated files are compressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Run `gzip <file>`, leaving `<file>.gz`.
    #[default]
    Gzip,
    /// Compress in-process with zstd, leaving `<file>.zst`.
    Zstd {
        #[serde(default = "default_zstd_level")]
        level: i32,
    },
    /// Run `<program> <args...> <file>`; only the exit status is observed.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_zstd_level() -> i32 {
    DEFAULT_ZSTD_LEVEL
}

/// Advisory locking of the log directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Take an exclusive `flock` on `.sk-delta-log.lock` while running.
    #[default]
    Flock,
    /// Trust the single-writer assumption without enforcing it.
    None,
}

/// Options consumed by [`DeltaLogger::start`](crate::DeltaLogger::start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggerConfig {
    /// Directory receiving log files. Without it the logger stays disabled.
    #[serde(default)]
    pub logdir: Option<PathBuf>,

    /// Rotation interval in seconds; `0` disables periodic rotation.
    #[serde(default = "default_interval")]
    pub interval: f64,

    /// Subscription context, e.g. `"vessels.self"` or `"vessels.*"`.
    #[serde(default = "default_context")]
    pub context: String,

    /// Paths to subscribe to. Empty means log every delta unthrottled.
    #[serde(default)]
    pub paths: Vec<SubscriptionItem>,

    #[serde(default)]
    pub compression: Compression,

    #[serde(default)]
    pub lock_mode: LockMode,

    #[serde(default = "default_max_concurrent_compressions")]
    pub max_concurrent_compressions: usize,
}

fn default_interval() -> f64 {
    DEFAULT_INTERVAL_SECS
}

fn default_context() -> String {
    DEFAULT_CONTEXT.to_string()
}

fn default_max_concurrent_compressions() -> usize {
    DEFAULT_MAX_CONCURRENT_COMPRESSIONS
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            logdir: None,
            interval: DEFAULT_INTERVAL_SECS,
            context: default_context(),
            paths: Vec::new(),
            compression: Compression::default(),
            lock_mode: LockMode::default(),
            max_concurrent_compressions: DEFAULT_MAX_CONCURRENT_COMPRESSIONS,
        }
    }
}

impl LoggerConfig {
    /// Start building a configuration for the given log directory.
    pub fn builder(logdir: impl AsRef<Path>) -> LoggerConfigBuilder {
        LoggerConfigBuilder {
            config: LoggerConfig {
                logdir: Some(logdir.as_ref().to_path_buf()),
                ..LoggerConfig::default()
            },
        }
    }

    /// Parse the host's JSON options.
    pub fn from_json(options: &serde_json::Value) -> Result<Self> {
        LoggerConfig::deserialize(options).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check the options that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        match &self.logdir {
            None => return Err(Error::Config("no log directory configured".into())),
            Some(dir) if dir.as_os_str().is_empty() => {
                return Err(Error::Config("log directory is empty".into()));
            }
            Some(_) => {}
        }
        self.period()?;
        if self.max_concurrent_compressions == 0 {
            return Err(Error::Config(
                "maxConcurrentCompressions must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Periodic rotation interval, or `None` when rotation is disabled or
    /// the interval is invalid (see [`LoggerConfig::validate`]).
    pub fn rotation_interval(&self) -> Option<Duration> {
        self.period().ok().flatten()
    }

    // `0` means no periodic rotation. Anything else must be a usable timer
    // period: finite, positive, representable, and at least one nanosecond.
    fn period(&self) -> Result<Option<Duration>> {
        if self.interval == 0.0 {
            return Ok(None);
        }
        let invalid = || {
            Error::Config(format!(
                "rotation interval must be 0 or a positive number of seconds, got {}",
                self.interval
            ))
        };
        if self.interval < 0.0 {
            return Err(invalid());
        }
        match Duration::try_from_secs_f64(self.interval) {
            Ok(period) if !period.is_zero() => Ok(Some(period)),
            _ => Err(invalid()),
        }
    }
}

/// Builder for [`LoggerConfig`].
///
/// # Examples
///
/// ```
/// use sk_delta_log::{Compression, LoggerConfig};
/// use std::time::Duration;
///
/// let config = LoggerConfig::builder("/var/log/sk")
///     .interval(Duration::from_secs(600))
///     .subscribe("navigation.*", 1000)
///     .subscribe("environment.wind.*", 5000)
///     .compression(Compression::Zstd { level: 3 })
///     .build();
/// assert_eq!(config.paths.len(), 2);
/// assert_eq!(config.rotation_interval(), Some(Duration::from_secs(600)));
/// ```
#[derive(Debug, Clone)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    /// Rotation interval. `Duration::ZERO` disables periodic rotation.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval.as_secs_f64();
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.config.context = context.into();
        self
    }

    /// Subscribe to `path` at most once every `period_ms` milliseconds.
    pub fn subscribe(mut self, path: impl Into<String>, period_ms: u64) -> Self {
        self.config.paths.push(SubscriptionItem::new(path, period_ms));
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.config.lock_mode = mode;
        self
    }

    pub fn max_concurrent_compressions(mut self, n: usize) -> Self {
        self.config.max_concurrent_compressions = n;
        self
    }

    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config = LoggerConfig::from_json(&json!({"logdir": "/tmp/x"})).unwrap();
        assert_eq!(config.logdir, Some(PathBuf::from("/tmp/x")));
        assert_eq!(config.interval, 3600.0);
        assert_eq!(config.context, "vessels.self");
        assert!(config.paths.is_empty());
        assert_eq!(config.compression, Compression::Gzip);
        assert_eq!(config.lock_mode, LockMode::Flock);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_json() {
        let config = LoggerConfig::from_json(&json!({
            "logdir": "/data",
            "interval": 0,
            "context": "vessels.*",
            "paths": [{"path": "navigation.*", "period": 1000}],
            "compression": {"zstd": {"level": 9}},
            "lockMode": "none",
            "maxConcurrentCompressions": 4
        }))
        .unwrap();
        assert_eq!(config.rotation_interval(), None);
        assert_eq!(config.paths, vec![SubscriptionItem::new("navigation.*", 1000)]);
        assert_eq!(config.compression, Compression::Zstd { level: 9 });
        assert_eq!(config.lock_mode, LockMode::None);
        assert_eq!(config.max_concurrent_compressions, 4);
    }

    #[test]
    fn test_command_compression_json() {
        let config = LoggerConfig::from_json(&json!({
            "logdir": "/data",
            "compression": {"command": {"program": "xz", "args": ["-9"]}}
        }))
        .unwrap();
        assert_eq!(
            config.compression,
            Compression::Command {
                program: "xz".into(),
                args: vec!["-9".into()]
            }
        );
    }

    #[test]
    fn test_missing_logdir_is_invalid() {
        let config = LoggerConfig::from_json(&json!({})).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_negative_interval_is_invalid() {
        let config = LoggerConfig::from_json(&json!({"logdir": "/d", "interval": -5})).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_out_of_range_intervals_are_invalid() {
        for interval in [1e20, 1e-10, f64::MAX] {
            let config = LoggerConfig {
                logdir: Some(PathBuf::from("/d")),
                interval,
                ..LoggerConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(Error::Config(_))),
                "interval {interval} accepted"
            );
            assert_eq!(config.rotation_interval(), None);
        }
    }

    #[test]
    fn test_non_finite_intervals_are_invalid() {
        for interval in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let config = LoggerConfig {
                logdir: Some(PathBuf::from("/d")),
                interval,
                ..LoggerConfig::default()
            };
            assert!(matches!(config.validate(), Err(Error::Config(_))));
            assert_eq!(config.rotation_interval(), None);
        }
    }

    #[test]
    fn test_sub_second_interval_is_valid() {
        let config = LoggerConfig::from_json(&json!({"logdir": "/d", "interval": 0.25})).unwrap();
        config.validate().unwrap();
        assert_eq!(config.rotation_interval(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let result = LoggerConfig::from_json(&json!({"logdir": "/d", "interval": "hourly"}));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
