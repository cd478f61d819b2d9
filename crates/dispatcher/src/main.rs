//! `postproc-dispatcher` -- broker-driven post-processing launcher.
//!
//! Subscribes to the configured queues and starts one worker process per
//! message, never letting more than `MAX_PROCS` workers pile up before the
//! next message is accepted. Publishes a heartbeat on its own connection.
//!
//! # Environment variables
//!
//! | Variable          | Required | Default | Description                              |
//! |-------------------|----------|---------|------------------------------------------|
//! | `POSTPROC_CONFIG` | no       | --      | JSON config file; overrides the env vars |
//! | `LOG_FORMAT`      | no       | text    | `json` for JSON log lines                |
//! | `RUST_LOG`        | no       | info    | `tracing` filter directives              |
//!
//! The remaining settings are documented on
//! [`DispatcherConfig::from_env`](postproc_core::config::DispatcherConfig::from_env).

use postproc_broker::{StompClient, StompConfig};
use postproc_core::config::DispatcherConfig;
use postproc_dispatcher::consumer::Consumer;
use postproc_dispatcher::heartbeat::{self, HeartbeatReporter};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = DispatcherConfig::load().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let stomp_config = StompConfig::new(
        &config.failover_uri,
        config.amq_user.clone(),
        config.amq_pwd.clone(),
    )
    .unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid broker address");
        std::process::exit(1);
    });
    let client = StompClient::new(stomp_config);

    tracing::info!(
        failover_uri = %config.failover_uri,
        queues = ?config.amq_queues,
        max_procs = config.max_procs,
        error_destination = %config.postprocess_error,
        heartbeat_destination = %config.heart_beat,
        "Starting postproc-dispatcher",
    );

    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            signal_cancel.cancel();
        }
    });

    let reporter = HeartbeatReporter::new(client.clone(), config.heart_beat.clone());
    let heartbeat_interval = config.heartbeat_interval();
    let heartbeat_cancel = cancel.clone();
    let heartbeat_handle = tokio::spawn(async move {
        reporter.run(heartbeat_interval, heartbeat_cancel).await;
    });

    let consumer = Consumer::new(client, &config);
    consumer.run(cancel).await;

    heartbeat::join_task(heartbeat_handle).await;

    let counts = consumer.counts();
    tracing::info!(
        dispatched = counts.dispatched,
        failed = counts.failed,
        sessions = counts.sessions,
        still_running = consumer.pool().size().await,
        "postproc-dispatcher stopped, running workers left in place",
    );
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "postproc_dispatcher=info,postproc_broker=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
