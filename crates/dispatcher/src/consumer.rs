//! Message consumer: connect, subscribe, dispatch, reconnect.
//!
//! [`Consumer::run`] loops forever: open a session, subscribe every queue,
//! hand each delivery to the launcher, and after any disconnect wait a fixed
//! delay and start over. Deliveries are handled one at a time; the next
//! frame is not read until the current message has been launched, the pool
//! is back at or under its ceiling, and the message has been settled.
//!
//! Shutdown also interrupts a closed gate. The message whose worker is
//! already running is still acknowledged so it is not redelivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use postproc_broker::{BrokerError, BrokerResult, Connector, Message, Session, SubscribeOptions};
use postproc_core::config::DispatcherConfig;
use tokio_util::sync::CancellationToken;

use crate::error::HandlingError;
use crate::launcher::JobLauncher;
use crate::pool::ProcessPool;

/// Subscription ids are this prefix followed by the queue name.
pub const SUBSCRIPTION_PREFIX: &str = "postproc-dispatcher-";

/// Why a session stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// Shutdown was requested; the session was closed gracefully.
    Shutdown,
    /// The broker closed the connection.
    Closed,
    /// Subscribing, receiving or settling a message failed.
    Failed(BrokerError),
}

/// Counters since the consumer was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounts {
    pub sessions: u64,
    pub dispatched: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct DispatchStats {
    sessions: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
}

pub struct Consumer<C: Connector> {
    connector: C,
    queues: Vec<String>,
    error_destination: String,
    launcher: JobLauncher,
    pool: Arc<ProcessPool>,
    reconnect_delay: Duration,
    stats: DispatchStats,
}

impl<C: Connector> Consumer<C> {
    pub fn new(connector: C, config: &DispatcherConfig) -> Self {
        Self {
            connector,
            queues: config.amq_queues.clone(),
            error_destination: config.postprocess_error.clone(),
            launcher: JobLauncher::from_config(config),
            pool: Arc::new(ProcessPool::new(config.max_procs)),
            reconnect_delay: config.reconnect_delay(),
            stats: DispatchStats::default(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_pool(mut self, pool: Arc<ProcessPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn pool(&self) -> &Arc<ProcessPool> {
        &self.pool
    }

    pub fn counts(&self) -> DispatchCounts {
        DispatchCounts {
            sessions: self.stats.sessions.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Consume until `cancel` fires, reconnecting after every disconnect.
    ///
    /// Workers already launched keep running after this returns.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            queues = ?self.queues,
            max_procs = self.pool.max_procs(),
            "Starting consumer",
        );

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(session) => {
                    self.stats.sessions.fetch_add(1, Ordering::Relaxed);
                    match self.run_session(session, &cancel).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed => {
                            tracing::warn!("Broker closed the connection");
                        }
                        SessionEnd::Failed(e) => {
                            tracing::error!(error = %e, "Connection error");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Connection error");
                }
            }

            tracing::info!(
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "Reconnecting after delay",
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        tracing::info!("Consumer stopped");
    }

    /// Subscribe every configured queue on `session` and dispatch
    /// deliveries until the session ends.
    pub async fn run_session(&self, mut session: C::Session, cancel: &CancellationToken) -> SessionEnd {
        for queue in &self.queues {
            let options = SubscribeOptions::client_individual(format!("{SUBSCRIPTION_PREFIX}{queue}"))
                .with_error_destination(self.error_destination.as_str());
            if let Err(e) = session.subscribe(queue, options).await {
                return SessionEnd::Failed(e);
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = session.next_message() => Some(next),
            };

            let Some(next) = next else {
                if let Err(e) = session.disconnect().await {
                    tracing::warn!(error = %e, "Error while disconnecting");
                }
                return SessionEnd::Shutdown;
            };

            match next {
                Ok(Some(message)) => {
                    if let Err(e) = self.dispatch(&mut session, message, cancel).await {
                        return SessionEnd::Failed(e);
                    }
                }
                Ok(None) => return SessionEnd::Closed,
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }

    /// Handle one delivery and settle it: acknowledge on success, fail to
    /// the error destination otherwise.
    async fn dispatch(
        &self,
        session: &mut C::Session,
        message: Message,
        cancel: &CancellationToken,
    ) -> BrokerResult<()> {
        tracing::info!(
            destination = %message.destination,
            body = %message.body,
            "Received message",
        );

        match self.handle_message(&message, cancel).await {
            Ok(()) => {
                session.acknowledge(message.into_ack_token()).await?;
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(
                    destination = %message.destination,
                    error = %e,
                    "Error processing incoming message",
                );
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                session.fail(message, &e.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Launch a worker for `message` and wait until the pool is back under
    /// its ceiling, or until `cancel` fires.
    pub async fn handle_message(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), HandlingError> {
        if message.destination.is_empty() {
            return Err(HandlingError::MissingDestination);
        }

        let spec = self.launcher.build_command(&message.destination, &message.body);
        tracing::debug!(command = %spec, "Command");

        let job = self.launcher.launch(&spec)?;
        let running = self.pool.register(job).await;

        let at_capacity = running > self.pool.max_procs();
        if at_capacity {
            tracing::info!(running, "Maximum number of sub-processes reached");
        }

        let running = tokio::select! {
            _ = cancel.cancelled() => {
                let running = self.pool.size().await;
                tracing::info!(running, "Shutdown requested while waiting for a free slot");
                return Ok(());
            }
            running = self.pool.wait_for_capacity() => running,
        };

        if at_capacity {
            tracing::info!(running, "Resuming");
        }
        Ok(())
    }
}
