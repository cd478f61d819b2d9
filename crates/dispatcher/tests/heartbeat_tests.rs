mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{AfterScript, Event, FakeConnector, LogCapture, Script};
use postproc_broker::{StompClient, StompConfig};
use postproc_dispatcher::error::HeartbeatError;
use postproc_dispatcher::heartbeat::{join_task, HeartbeatReporter};
use tokio_util::sync::CancellationToken;

const HEARTBEAT_TOPIC: &str = "/topic/SNS.COMMON.STATUS.POSTPROC.0";

fn sent_bodies(connector: &FakeConnector) -> Vec<(String, String)> {
    connector
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Sent {
                destination, body, ..
            } => Some((destination, body)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn publishes_status_record_on_its_own_session() {
    let connector = FakeConnector::new(vec![Script::Deliver(vec![], AfterScript::Close)]);
    let reporter = HeartbeatReporter::new(connector.clone(), HEARTBEAT_TOPIC);

    let record = reporter.try_send().await.unwrap();
    assert_eq!(record.pid, std::process::id());

    let sent = sent_bodies(&connector);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, HEARTBEAT_TOPIC);

    let body: serde_json::Value = serde_json::from_str(&sent[0].1).unwrap();
    assert_eq!(body["status"], "0");
    assert_eq!(body["pid"], std::process::id().to_string());
    assert!(body["src_name"].as_str().is_some_and(|s| !s.is_empty()));

    assert_eq!(connector.events().last(), Some(&Event::Disconnected(1)));
    assert!(connector.subscriptions().is_empty());
}

#[tokio::test]
async fn refused_connection_is_logged_and_swallowed() {
    let (logs, _guard) = LogCapture::install();
    let connector = FakeConnector::new(vec![Script::Refuse, Script::Refuse]);
    let reporter = HeartbeatReporter::new(connector.clone(), HEARTBEAT_TOPIC);

    assert_matches!(reporter.try_send().await, Err(HeartbeatError::Connect(_)));
    assert!(!logs.contents().contains("Could not send heartbeat"));

    reporter.send_heartbeat().await;
    assert_eq!(connector.connects(), 2);
    assert!(sent_bodies(&connector).is_empty());

    let output = logs.contents();
    let line = output
        .lines()
        .find(|l| l.contains("Could not send heartbeat"))
        .unwrap_or_else(|| panic!("no heartbeat error logged: {output}"));
    assert!(line.contains("ERROR"), "{line}");
    assert!(line.contains("connection refused"), "{line}");
    assert!(line.contains(HEARTBEAT_TOPIC), "{line}");
}

#[tokio::test]
async fn unreachable_broker_does_not_panic() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = StompConfig::new(&format!("tcp://127.0.0.1:{port}"), "", "")
        .unwrap()
        .with_connect_timeout(Duration::from_millis(500));
    let reporter = HeartbeatReporter::new(StompClient::new(config), HEARTBEAT_TOPIC);

    assert_matches!(reporter.try_send().await, Err(HeartbeatError::Connect(_)));
    reporter.send_heartbeat().await;
}

#[tokio::test]
async fn run_sends_immediately_then_stops_on_cancel() {
    let connector = FakeConnector::new(
        (0..4)
            .map(|_| Script::Deliver(vec![], AfterScript::Close))
            .collect(),
    );
    let reporter = HeartbeatReporter::new(connector.clone(), HEARTBEAT_TOPIC);
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        reporter.run(Duration::from_millis(100), token).await;
    });

    assert!(common::wait_for(Duration::from_millis(80), || sent_bodies(&connector).len() == 1).await);
    assert!(common::wait_for(Duration::from_secs(1), || sent_bodies(&connector).len() >= 2).await);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("reporter did not stop")
        .unwrap();
}

#[tokio::test]
async fn panicked_heartbeat_task_is_logged() {
    let (logs, _guard) = LogCapture::install();

    let handle = tokio::spawn(async { panic!("heartbeat exploded") });
    assert!(!join_task(handle).await);

    let output = logs.contents();
    assert!(
        output
            .lines()
            .any(|l| l.contains("ERROR") && l.contains("Heartbeat task failed")),
        "{output}"
    );
}

#[tokio::test]
async fn finished_heartbeat_task_joins_cleanly() {
    let connector = FakeConnector::default();
    let reporter = HeartbeatReporter::new(connector, HEARTBEAT_TOPIC);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let handle = tokio::spawn(async move {
        reporter.run(Duration::from_secs(30), cancel).await;
    });
    assert!(join_task(handle).await);
}
