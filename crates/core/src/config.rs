//! Dispatcher configuration.
//!
//! Loaded once at startup, either from a JSON file (when `POSTPROC_CONFIG`
//! is set) or from environment variables. Field names in the JSON file
//! match the snake_case names below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::CoreError;

/// Environment variable naming an optional JSON config file.
pub const CONFIG_FILE_ENV: &str = "POSTPROC_CONFIG";

pub const DEFAULT_MAX_PROCS: usize = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
pub const DEFAULT_ERROR_DESTINATION: &str = "/queue/POSTPROCESS.ERROR";
pub const DEFAULT_HEARTBEAT_DESTINATION: &str = "/topic/SNS.COMMON.STATUS.POSTPROC.0";

/// Everything the dispatcher needs to connect, subscribe and launch workers.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Broker address, e.g. `failover:(tcp://amq1:61613,tcp://amq2:61613)`.
    pub failover_uri: String,
    pub amq_user: String,
    pub amq_pwd: String,
    /// Queues to subscribe to.
    pub amq_queues: Vec<String>,
    /// Destination that failed messages are forwarded to.
    #[serde(default = "default_error_destination")]
    pub postprocess_error: String,
    /// Directory holding the task script.
    pub python_dir: PathBuf,
    /// Task script, relative to `python_dir`.
    pub task_script: String,
    /// Interpreter or wrapper the worker is started with.
    pub start_script: String,
    /// Flag placed before the queue name argument, if any.
    #[serde(default)]
    pub task_script_queue_arg: Option<String>,
    /// Flag placed before the payload argument, if any.
    #[serde(default)]
    pub task_script_data_arg: Option<String>,
    /// Concurrency ceiling for worker processes.
    #[serde(default = "default_max_procs")]
    pub max_procs: usize,
    /// Destination heartbeats are published to.
    #[serde(default = "default_heartbeat_destination")]
    pub heart_beat: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

fn default_error_destination() -> String {
    DEFAULT_ERROR_DESTINATION.to_string()
}

fn default_heartbeat_destination() -> String {
    DEFAULT_HEARTBEAT_DESTINATION.to_string()
}

fn default_max_procs() -> usize {
    DEFAULT_MAX_PROCS
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_reconnect_delay_secs() -> u64 {
    DEFAULT_RECONNECT_DELAY_SECS
}

impl DispatcherConfig {
    /// Load from the file named by `POSTPROC_CONFIG` if set, otherwise from
    /// environment variables.
    pub fn load() -> Result<Self, CoreError> {
        match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => Self::from_env(),
        }
    }

    /// Read and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigFile {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|source| CoreError::ConfigParse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// | Env Var                   | Default                                 |
    /// |---------------------------|-----------------------------------------|
    /// | `FAILOVER_URI`            | required                                |
    /// | `AMQ_USER`                | empty                                   |
    /// | `AMQ_PWD`                 | empty                                   |
    /// | `AMQ_QUEUES`              | required, comma separated               |
    /// | `POSTPROCESS_ERROR`       | `/queue/POSTPROCESS.ERROR`              |
    /// | `PYTHON_DIR`              | required                                |
    /// | `TASK_SCRIPT`             | required                                |
    /// | `START_SCRIPT`            | `python`                                |
    /// | `TASK_SCRIPT_QUEUE_ARG`   | none                                    |
    /// | `TASK_SCRIPT_DATA_ARG`    | none                                    |
    /// | `MAX_PROCS`               | `5`                                     |
    /// | `HEART_BEAT`              | `/topic/SNS.COMMON.STATUS.POSTPROC.0`   |
    /// | `HEARTBEAT_INTERVAL_SECS` | `30`                                    |
    /// | `RECONNECT_DELAY_SECS`    | `5`                                     |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| {
            get(key).ok_or_else(|| CoreError::Config(format!("{key} must be set")))
        };

        let amq_queues = require("AMQ_QUEUES")?
            .split(',')
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();

        let config = Self {
            failover_uri: require("FAILOVER_URI")?,
            amq_user: get("AMQ_USER").unwrap_or_default(),
            amq_pwd: get("AMQ_PWD").unwrap_or_default(),
            amq_queues,
            postprocess_error: get("POSTPROCESS_ERROR").unwrap_or_else(default_error_destination),
            python_dir: PathBuf::from(require("PYTHON_DIR")?),
            task_script: require("TASK_SCRIPT")?,
            start_script: get("START_SCRIPT").unwrap_or_else(|| "python".to_string()),
            task_script_queue_arg: get("TASK_SCRIPT_QUEUE_ARG"),
            task_script_data_arg: get("TASK_SCRIPT_DATA_ARG"),
            max_procs: parse_or(get("MAX_PROCS"), "MAX_PROCS", DEFAULT_MAX_PROCS)?,
            heart_beat: get("HEART_BEAT").unwrap_or_else(default_heartbeat_destination),
            heartbeat_interval_secs: parse_or(
                get("HEARTBEAT_INTERVAL_SECS"),
                "HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )?,
            reconnect_delay_secs: parse_or(
                get("RECONNECT_DELAY_SECS"),
                "RECONNECT_DELAY_SECS",
                DEFAULT_RECONNECT_DELAY_SECS,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the dispatcher relies on.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.failover_uri.trim().is_empty() {
            return Err(CoreError::Validation("failover_uri must not be empty".into()));
        }
        if self.amq_queues.is_empty() || self.amq_queues.iter().any(|q| q.trim().is_empty()) {
            return Err(CoreError::Validation(
                "amq_queues must list at least one non-empty queue".into(),
            ));
        }
        if self.max_procs == 0 {
            return Err(CoreError::Validation("max_procs must be at least 1".into()));
        }
        if self.start_script.trim().is_empty() || self.task_script.trim().is_empty() {
            return Err(CoreError::Validation(
                "start_script and task_script must not be empty".into(),
            ));
        }
        if self.postprocess_error.trim().is_empty() || self.heart_beat.trim().is_empty() {
            return Err(CoreError::Validation(
                "postprocess_error and heart_beat destinations must not be empty".into(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(CoreError::Validation(
                "heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Full path of the task script handed to the start script.
    pub fn task_script_path(&self) -> PathBuf {
        self.python_dir.join(&self.task_script)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| CoreError::Config(format!("{key} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}
