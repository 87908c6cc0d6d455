//! Runtime configuration parsed from environment variables.
//!
//! Every knob has a `DEFAULT_*` fallback, so an empty environment yields a
//! working server. `Config::default()` is the same set of defaults without
//! touching the environment, which is what tests use.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PRESENCE_TTL_MS: u64 = 5_000;
pub const DEFAULT_PRESENCE_SWEEP_MS: u64 = 1_000;
pub const DEFAULT_EDIT_WINDOW_MS: u64 = 500;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_BUFFER_FLUSH_MS: u64 = 1_000;
pub const DEFAULT_ROOM_GRACE_MS: u64 = 60_000;
pub const DEFAULT_LANGUAGE: &str = "javascript";
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("PRESENCE_TTL_MS ({ttl_ms}) must be shorter than HEARTBEAT_TIMEOUT_MS ({timeout_ms})")]
    PresenceOutlivesHeartbeat { ttl_ms: u128, timeout_ms: u128 },
}

/// Settings for the local process execution backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecConfig {
    /// Parent directory for per-run scratch directories.
    pub work_dir: PathBuf,
    /// Wall-clock limit for a single run, compile step included.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    /// Interval advertised to clients for sending `HEARTBEAT` frames.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is torn down.
    pub heartbeat_timeout: Duration,
    /// Lifetime of a presence entry after its last activity.
    pub presence_ttl: Duration,
    /// Period of the presence/heartbeat sweep.
    pub sweep_interval: Duration,
    /// Advisory edit window opened by `TYPING`.
    pub edit_window: Duration,
    pub outbound_queue_capacity: usize,
    pub buffer_flush_interval: Duration,
    /// How long an empty room keeps its live state before eviction.
    pub room_grace: Duration,
    pub default_language: String,
    pub exec: ExecConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            presence_ttl: Duration::from_millis(DEFAULT_PRESENCE_TTL_MS),
            sweep_interval: Duration::from_millis(DEFAULT_PRESENCE_SWEEP_MS),
            edit_window: Duration::from_millis(DEFAULT_EDIT_WINDOW_MS),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            buffer_flush_interval: Duration::from_millis(DEFAULT_BUFFER_FLUSH_MS),
            room_grace: Duration::from_millis(DEFAULT_ROOM_GRACE_MS),
            default_language: DEFAULT_LANGUAGE.to_owned(),
            exec: ExecConfig {
                work_dir: std::env::temp_dir(),
                timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            },
        }
    }
}

impl Config {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `HEARTBEAT_INTERVAL_MS` / `HEARTBEAT_TIMEOUT_MS`: default 10000 / 30000
    /// - `PRESENCE_TTL_MS` / `PRESENCE_SWEEP_MS`: default 5000 / 1000
    /// - `EDIT_WINDOW_MS`: default 500
    /// - `OUTBOUND_QUEUE_CAPACITY`: default 256
    /// - `BUFFER_FLUSH_MS`: default 1000
    /// - `ROOM_GRACE_MS`: default 60000
    /// - `DEFAULT_LANGUAGE`: default `javascript`
    /// - `EXEC_WORK_DIR`: default OS temp dir
    /// - `EXEC_TIMEOUT_SECS`: default 30
    ///
    /// # Errors
    ///
    /// Returns an error when an interval is zero or the presence TTL is not
    /// shorter than the heartbeat timeout.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            port: env_parse("PORT", DEFAULT_PORT),
            heartbeat_interval: env_millis("HEARTBEAT_INTERVAL_MS", DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: env_millis("HEARTBEAT_TIMEOUT_MS", DEFAULT_HEARTBEAT_TIMEOUT_MS),
            presence_ttl: env_millis("PRESENCE_TTL_MS", DEFAULT_PRESENCE_TTL_MS),
            sweep_interval: env_millis("PRESENCE_SWEEP_MS", DEFAULT_PRESENCE_SWEEP_MS),
            edit_window: env_millis("EDIT_WINDOW_MS", DEFAULT_EDIT_WINDOW_MS),
            outbound_queue_capacity: env_parse("OUTBOUND_QUEUE_CAPACITY", DEFAULT_OUTBOUND_QUEUE_CAPACITY),
            buffer_flush_interval: env_millis("BUFFER_FLUSH_MS", DEFAULT_BUFFER_FLUSH_MS),
            room_grace: env_millis("ROOM_GRACE_MS", DEFAULT_ROOM_GRACE_MS),
            default_language: std::env::var("DEFAULT_LANGUAGE").unwrap_or(defaults.default_language),
            exec: ExecConfig {
                work_dir: std::env::var("EXEC_WORK_DIR").map_or(defaults.exec.work_dir, PathBuf::from),
                timeout: Duration::from_secs(env_parse("EXEC_TIMEOUT_SECS", DEFAULT_EXEC_TIMEOUT_SECS)),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("HEARTBEAT_INTERVAL_MS", self.heartbeat_interval),
            ("HEARTBEAT_TIMEOUT_MS", self.heartbeat_timeout),
            ("PRESENCE_TTL_MS", self.presence_ttl),
            ("PRESENCE_SWEEP_MS", self.sweep_interval),
            ("BUFFER_FLUSH_MS", self.buffer_flush_interval),
            ("EXEC_TIMEOUT_SECS", self.exec.timeout),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Zero("OUTBOUND_QUEUE_CAPACITY"));
        }
        if self.presence_ttl >= self.heartbeat_timeout {
            return Err(ConfigError::PresenceOutlivesHeartbeat {
                ttl_ms: self.presence_ttl.as_millis(),
                timeout_ms: self.heartbeat_timeout.as_millis(),
            });
        }
        Ok(())
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key, default))
}
