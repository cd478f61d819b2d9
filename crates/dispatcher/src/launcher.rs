//! Turns a message into a worker process.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use postproc_core::config::DispatcherConfig;
use postproc_core::job::{CommandTemplate, JobSpec};
use tokio::process::Command;

use crate::error::LaunchError;
use crate::pool::RunningJob;

pub struct JobLauncher {
    template: CommandTemplate,
    next_id: AtomicU64,
}

impl JobLauncher {
    pub fn new(template: CommandTemplate) -> Self {
        Self {
            template,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(CommandTemplate::from_config(config))
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }

    pub fn build_command(&self, destination: &str, body: &str) -> JobSpec {
        self.template.build(destination, body)
    }

    /// Start the worker without waiting for it.
    ///
    /// stdout and stderr are inherited so worker output lands in the
    /// dispatcher's log stream.
    pub fn launch(&self, spec: &JobSpec) -> Result<RunningJob, LaunchError> {
        let child = Command::new(&spec.executable)
            .args(&spec.args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| LaunchError::from_io(&spec.executable, e))?;

        let job = RunningJob::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            spec.to_string(),
            child,
        );

        tracing::info!(
            job_id = job.info.id,
            pid = ?job.info.pid,
            command = %job.info.command,
            "Launched worker",
        );
        Ok(job)
    }
}
