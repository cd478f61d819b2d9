//! In-flight worker tracking and the backpressure gate.
//!
//! Every registered job gets a watcher task that owns the child process,
//! waits for it to exit and then signals the pool. The pool never kills a
//! worker; a slot is only freed when its process exits on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::{Mutex, Notify};

/// Upper bound between capacity re-checks while the gate is closed.
pub const GATE_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Descriptive data about a launched worker.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: u64,
    /// OS process id, `None` if the process already exited when spawned.
    pub pid: Option<u32>,
    /// Rendered command line, for logs.
    pub command: String,
    pub started_at: DateTime<Utc>,
}

/// A freshly started worker, not yet handed to a [`ProcessPool`].
#[derive(Debug)]
pub struct RunningJob {
    pub info: JobInfo,
    child: Child,
}

impl RunningJob {
    pub fn new(id: u64, command: impl Into<String>, child: Child) -> Self {
        Self {
            info: JobInfo {
                id,
                pid: child.id(),
                command: command.into(),
                started_at: Utc::now(),
            },
            child,
        }
    }
}

struct TrackedJob {
    info: JobInfo,
    exited: Arc<AtomicBool>,
}

/// Set of running workers checked against a concurrency ceiling.
pub struct ProcessPool {
    jobs: Mutex<Vec<TrackedJob>>,
    exit_signal: Arc<Notify>,
    max_procs: usize,
    recheck_interval: Duration,
}

impl ProcessPool {
    pub fn new(max_procs: usize) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            exit_signal: Arc::new(Notify::new()),
            max_procs,
            recheck_interval: GATE_RECHECK_INTERVAL,
        }
    }

    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    pub fn max_procs(&self) -> usize {
        self.max_procs
    }

    /// Start tracking `job`. Never rejects; returns the new tracked count.
    pub async fn register(&self, job: RunningJob) -> usize {
        let RunningJob { info, child } = job;
        let exited = Arc::new(AtomicBool::new(false));

        tokio::spawn(watch_exit(
            info.clone(),
            child,
            Arc::clone(&exited),
            Arc::clone(&self.exit_signal),
        ));

        let mut jobs = self.jobs.lock().await;
        jobs.push(TrackedJob { info, exited });
        jobs.len()
    }

    /// Drop every job whose process has exited. Returns how many were removed.
    pub async fn reap(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|job| {
            let done = job.exited.load(Ordering::Acquire);
            if done {
                tracing::debug!(job_id = job.info.id, pid = ?job.info.pid, "Reaped worker");
            }
            !done
        });
        before - jobs.len()
    }

    pub async fn size(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Snapshot of the tracked jobs, oldest first.
    pub async fn jobs(&self) -> Vec<JobInfo> {
        self.jobs.lock().await.iter().map(|j| j.info.clone()).collect()
    }

    /// Block until at most `max_procs` workers are tracked.
    ///
    /// Reaps on every pass and sleeps until a worker exits, re-checking at
    /// least every `recheck_interval`. Returns the tracked count on exit.
    pub async fn wait_for_capacity(&self) -> usize {
        loop {
            self.reap().await;
            let size = self.size().await;
            if size <= self.max_procs {
                return size;
            }

            tokio::select! {
                _ = self.exit_signal.notified() => {}
                _ = tokio::time::sleep(self.recheck_interval) => {}
            }
        }
    }
}

async fn watch_exit(info: JobInfo, mut child: Child, exited: Arc<AtomicBool>, signal: Arc<Notify>) {
    match child.wait().await {
        Ok(status) => {
            let elapsed_ms = (Utc::now() - info.started_at).num_milliseconds();
            tracing::debug!(
                job_id = info.id,
                pid = ?info.pid,
                exit_code = ?status.code(),
                elapsed_ms,
                "Worker exited",
            );
        }
        Err(e) => {
            tracing::warn!(job_id = info.id, error = %e, "Lost track of worker process");
        }
    }

    exited.store(true, Ordering::Release);
    signal.notify_one();
}
