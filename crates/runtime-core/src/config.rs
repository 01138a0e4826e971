//! Runtime configuration types

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable selecting the start method
pub const ENV_START_METHOD: &str = "STRATA_START_METHOD";
/// Environment variable holding the join timeout in milliseconds
pub const ENV_JOIN_TIMEOUT_MS: &str = "STRATA_JOIN_TIMEOUT_MS";
/// Environment variable pointing at the report directory
pub const ENV_REPORT_DIR: &str = "STRATA_REPORT_DIR";
/// Environment variable pointing at the program spawned workers execute
pub const ENV_WORKER_PROGRAM: &str = "STRATA_WORKER_PROGRAM";

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Launcher settings
    pub launcher: LauncherConfig,

    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Parse a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overlaid with `STRATA_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.launcher.apply_env()?;
        Ok(config)
    }
}

/// Launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Process start method ("spawn" or "fork")
    pub start_method: String,

    /// How long the coordinator waits for workers; `None` waits indefinitely
    #[serde(with = "opt_millis")]
    pub join_timeout: Option<Duration>,

    /// How often the coordinator polls worker processes
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Directory for payload and report files (system temp dir if unset)
    pub report_dir: Option<PathBuf>,

    /// Program spawned workers execute (current executable if unset)
    pub worker_program: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            start_method: "spawn".to_string(),
            join_timeout: None,
            poll_interval: Duration::from_millis(20),
            report_dir: None,
            worker_program: None,
        }
    }
}

impl LauncherConfig {
    /// Overlay values from `STRATA_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(method) = std::env::var(ENV_START_METHOD) {
            self.start_method = method;
        }

        if let Ok(raw) = std::env::var(ENV_JOIN_TIMEOUT_MS) {
            let millis: u64 = raw.parse().map_err(|_| Error::InvalidConfig {
                message: format!("{} must be an integer, got '{}'", ENV_JOIN_TIMEOUT_MS, raw),
            })?;
            self.join_timeout = Some(Duration::from_millis(millis));
        }

        if let Ok(dir) = std::env::var(ENV_REPORT_DIR) {
            self.report_dir = Some(PathBuf::from(dir));
        }

        if let Ok(program) = std::env::var(ENV_WORKER_PROGRAM) {
            self.worker_program = Some(PathBuf::from(program));
        }

        Ok(())
    }

    /// Directory for payload and report files
    pub fn report_dir(&self) -> PathBuf {
        self.report_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// fsync checkpoint files before renaming them into place
    pub sync_on_write: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "launcher=info,checkpoint=info,runtime_core=info".to_string(),
        }
    }
}

/// Duration serialization as milliseconds
mod millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Optional duration serialization as milliseconds
mod opt_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
