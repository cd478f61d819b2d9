//! Shared test helpers: an in-memory broker and worker scripts.
//!
//! [`FakeConnector`] hands out scripted sessions in order and records every
//! call made on them into a shared event log.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use postproc_broker::{
    AckToken, BrokerError, BrokerResult, Connector, Message, Session, SubscribeOptions,
};
use postproc_core::config::DispatcherConfig;

/// What the next `connect()` call does.
pub enum Script {
    /// Fail with a connection error.
    Refuse,
    /// Deliver these `(destination, body)` pairs, then do `then`.
    Deliver(Vec<(String, String)>, AfterScript),
}

/// What a session does once its deliveries run out.
#[derive(Clone, Copy)]
pub enum AfterScript {
    /// Report a broker-side close.
    Close,
    /// Never deliver anything again.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(usize),
    Subscribed {
        session: usize,
        destination: String,
        id: String,
        prefetch: u32,
        error_destination: Option<String>,
    },
    Acked {
        session: usize,
        message_id: String,
    },
    Failed {
        session: usize,
        message_id: String,
        reason: String,
    },
    Sent {
        session: usize,
        destination: String,
        body: String,
    },
    Disconnected(usize),
}

type AckHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Shared {
    scripts: VecDeque<Script>,
    events: Vec<Event>,
    connects: usize,
    ack_hook: Option<AckHook>,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    shared: Arc<Mutex<Shared>>,
}

impl FakeConnector {
    pub fn new(scripts: Vec<Script>) -> Self {
        let connector = Self::default();
        connector.shared.lock().unwrap().scripts = scripts.into();
        connector
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.lock().unwrap().events.clone()
    }

    pub fn connects(&self) -> usize {
        self.shared.lock().unwrap().connects
    }

    /// Run `hook` just before every acknowledgment is recorded.
    pub fn on_ack(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.shared.lock().unwrap().ack_hook = Some(Arc::new(hook));
    }

    pub fn acked_ids(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Acked { message_id, .. } => Some(message_id),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Failed {
                    message_id, reason, ..
                } => Some((message_id, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Subscribed { .. }))
            .collect()
    }

    fn record(&self, event: Event) {
        self.shared.lock().unwrap().events.push(event);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self) -> BrokerResult<FakeSession> {
        let (script, index) = {
            let mut shared = self.shared.lock().unwrap();
            shared.connects += 1;
            (shared.scripts.pop_front(), shared.connects)
        };

        match script {
            None | Some(Script::Refuse) => {
                Err(BrokerError::Connection("connection refused".into()))
            }
            Some(Script::Deliver(deliveries, after)) => {
                self.record(Event::Connected(index));
                Ok(FakeSession {
                    index,
                    connector: self.clone(),
                    deliveries: deliveries.into(),
                    after,
                    subscriptions: HashMap::new(),
                    delivered: 0,
                })
            }
        }
    }
}

pub struct FakeSession {
    index: usize,
    connector: FakeConnector,
    deliveries: VecDeque<(String, String)>,
    after: AfterScript,
    /// destination -> subscription id
    subscriptions: HashMap<String, String>,
    delivered: usize,
}

#[async_trait]
impl Session for FakeSession {
    async fn subscribe(&mut self, destination: &str, options: SubscribeOptions) -> BrokerResult<()> {
        self.subscriptions
            .insert(destination.to_string(), options.id.clone());
        self.connector.record(Event::Subscribed {
            session: self.index,
            destination: destination.to_string(),
            id: options.id,
            prefetch: options.prefetch,
            error_destination: options.error_destination,
        });
        Ok(())
    }

    async fn next_message(&mut self) -> BrokerResult<Option<Message>> {
        match self.deliveries.pop_front() {
            Some((destination, body)) => {
                self.delivered += 1;
                let subscription = self
                    .subscriptions
                    .get(&destination)
                    .cloned()
                    .unwrap_or_else(|| "unsubscribed".to_string());
                let message_id = format!("ID:{}-{}", self.index, self.delivered);
                Ok(Some(Message::new(
                    destination.clone(),
                    body,
                    vec![
                        ("destination".to_string(), destination),
                        ("message-id".to_string(), message_id.clone()),
                    ],
                    AckToken::new(message_id, subscription),
                )))
            }
            None => match self.after {
                AfterScript::Close => Ok(None),
                AfterScript::Hang => std::future::pending().await,
            },
        }
    }

    async fn acknowledge(&mut self, token: AckToken) -> BrokerResult<()> {
        let hook = self.connector.shared.lock().unwrap().ack_hook.clone();
        if let Some(hook) = hook {
            hook();
        }
        self.connector.record(Event::Acked {
            session: self.index,
            message_id: token.message_id().to_string(),
        });
        Ok(())
    }

    async fn fail(&mut self, message: Message, reason: &str) -> BrokerResult<()> {
        self.connector.record(Event::Failed {
            session: self.index,
            message_id: message.ack_token().message_id().to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn send(&mut self, destination: &str, body: &str) -> BrokerResult<()> {
        self.connector.record(Event::Sent {
            session: self.index,
            destination: destination.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn disconnect(self) -> BrokerResult<()> {
        self.connector.record(Event::Disconnected(self.index));
        Ok(())
    }
}

/// Shorthand for a `(destination, body)` delivery.
pub fn delivery(destination: &str, body: &str) -> (String, String) {
    (destination.to_string(), body.to_string())
}

/// A worker script that logs its payload (`$2`) to `started`, sleeps, then
/// logs it to `finished`, both inside `dir`.
pub fn write_worker_script(dir: &Path, sleep_secs: f64) -> PathBuf {
    let path = dir.join("worker.sh");
    let started = dir.join("started");
    let finished = dir.join("finished");
    let body = format!(
        "#!/bin/sh\necho \"$2\" >> \"{}\"\nsleep {sleep_secs}\necho \"$2\" >> \"{}\"\n",
        started.display(),
        finished.display(),
    );
    std::fs::write(&path, body).expect("write worker script");
    path
}

/// Lines written to `dir/<name>` so far.
pub fn read_lines(dir: &Path, name: &str) -> Vec<String> {
    std::fs::read_to_string(dir.join(name))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Config that runs `sh <dir>/worker.sh <queue> <payload>`.
pub fn test_config(dir: &Path, queues: &[&str], max_procs: usize) -> DispatcherConfig {
    DispatcherConfig {
        failover_uri: "tcp://localhost:61613".to_string(),
        amq_user: String::new(),
        amq_pwd: String::new(),
        amq_queues: queues.iter().map(|q| q.to_string()).collect(),
        postprocess_error: "/queue/POSTPROCESS.ERROR".to_string(),
        python_dir: dir.to_path_buf(),
        task_script: "worker.sh".to_string(),
        start_script: "sh".to_string(),
        task_script_queue_arg: None,
        task_script_data_arg: None,
        max_procs,
        heart_beat: "/topic/SNS.COMMON.STATUS.POSTPROC.0".to_string(),
        heartbeat_interval_secs: 30,
        reconnect_delay_secs: 5,
    }
}

/// Poll `condition` every 20 ms for up to `timeout`.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Collects formatted log output for the current thread.
///
/// `#[tokio::test]` runs on a current-thread runtime, so events from the
/// test's own tasks reach the thread-local default installed here.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CaptureWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    /// Install as the default subscriber until the guard is dropped.
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let buf = capture.buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || CaptureWriter(buf.clone()))
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }
}
