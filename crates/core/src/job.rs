//! Worker invocation construction.
//!
//! A [`JobSpec`] is a pure function of the incoming message and the static
//! [`CommandTemplate`]; building one never touches the filesystem.

use std::fmt;

use crate::config::DispatcherConfig;

/// Executable plus ordered arguments for one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub executable: String,
    pub args: Vec<String>,
}

impl fmt::Display for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// The static part of every worker command line.
///
/// Layout: `<start_script> <task_script> [<queue_arg>] <destination> [<data_arg>] <payload>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub start_script: String,
    pub task_script: String,
    pub queue_arg: Option<String>,
    pub data_arg: Option<String>,
}

impl CommandTemplate {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            start_script: config.start_script.clone(),
            task_script: config.task_script_path().to_string_lossy().into_owned(),
            queue_arg: config.task_script_queue_arg.clone(),
            data_arg: config.task_script_data_arg.clone(),
        }
    }

    /// Build the invocation for a message received on `destination`.
    ///
    /// The body is passed as a single argument with every whitespace
    /// character removed. This is lossy for payloads that rely on
    /// whitespace; workers are expected to receive compact JSON.
    pub fn build(&self, destination: &str, body: &str) -> JobSpec {
        let mut args = Vec::with_capacity(5);
        args.push(self.task_script.clone());

        if let Some(flag) = &self.queue_arg {
            args.push(flag.clone());
        }
        args.push(destination.to_string());

        if let Some(flag) = &self.data_arg {
            args.push(flag.clone());
        }
        args.push(strip_whitespace(body));

        JobSpec {
            executable: self.start_script.clone(),
            args,
        }
    }
}

/// Remove every Unicode whitespace character from `body`.
pub fn strip_whitespace(body: &str) -> String {
    body.chars().filter(|c| !c.is_whitespace()).collect()
}
