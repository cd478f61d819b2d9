//! Liveness reporting.
//!
//! Each heartbeat opens its own broker session, publishes one
//! [`HeartbeatRecord`] and disconnects, so it is unaffected by the state of
//! the consumer's session. Failures are logged and swallowed.

use std::time::Duration;

use postproc_broker::{Connector, Session};
use postproc_core::heartbeat::HeartbeatRecord;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::HeartbeatError;

pub struct HeartbeatReporter<C: Connector> {
    connector: C,
    destination: String,
}

impl<C: Connector> HeartbeatReporter<C> {
    pub fn new(connector: C, destination: impl Into<String>) -> Self {
        Self {
            connector,
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Publish one heartbeat. Never fails; errors are logged.
    pub async fn send_heartbeat(&self) {
        if let Err(e) = self.try_send().await {
            tracing::error!(error = %e, destination = %self.destination, "Could not send heartbeat");
        }
    }

    /// Publish one heartbeat and return the record that was sent.
    pub async fn try_send(&self) -> Result<HeartbeatRecord, HeartbeatError> {
        let record = HeartbeatRecord::current();
        let body = record.to_json()?;

        let mut session = self
            .connector
            .connect()
            .await
            .map_err(HeartbeatError::Connect)?;
        session
            .send(&self.destination, &body)
            .await
            .map_err(HeartbeatError::Publish)?;
        session
            .disconnect()
            .await
            .map_err(HeartbeatError::Disconnect)?;

        tracing::debug!(destination = %self.destination, pid = record.pid, "Heartbeat sent");
        Ok(record)
    }

    /// Send a heartbeat every `interval` until `cancel` fires. The first one
    /// goes out immediately.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.send_heartbeat().await,
            }
        }

        tracing::info!("Heartbeat reporter stopped");
    }
}

/// Wait for the task running [`HeartbeatReporter::run`]. Returns `false`
/// and logs the failure if the task panicked or was aborted.
pub async fn join_task(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "Heartbeat task failed");
            false
        }
    }
}
