//! STOMP 1.1 client over TCP.
//!
//! [`StompClient`] holds the connection settings and implements
//! [`Connector`]; every [`connect`](Connector::connect) walks the failover
//! endpoints and returns a fresh [`StompSession`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::{BrokerError, BrokerResult};
use crate::failover::{Endpoint, FailoverUri};
use crate::frame::{Command, Frame, StompCodec};
use crate::traits::{AckToken, Connector, Message, Session, SubscribeOptions};

/// Protocol version requested in the `CONNECT` frame.
pub const STOMP_VERSION: &str = "1.1";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(5);

/// ActiveMQ extension header limiting unacknowledged deliveries.
const PREFETCH_HEADER: &str = "activemq.prefetchSize";

/// Headers that describe the original delivery and must not be copied when
/// forwarding a message to an error destination.
const DELIVERY_HEADERS: &[&str] = &[
    "destination",
    "message-id",
    "subscription",
    "ack",
    "content-length",
    "redelivered",
];

/// Connection settings shared by every session.
#[derive(Debug, Clone)]
pub struct StompConfig {
    pub uri: FailoverUri,
    pub login: String,
    pub passcode: String,
    /// Per-endpoint limit for TCP connect plus the `CONNECTED` handshake.
    pub connect_timeout: Duration,
    /// How long `disconnect` waits for the broker's receipt.
    pub receipt_timeout: Duration,
}

impl StompConfig {
    pub fn new(uri: &str, login: impl Into<String>, passcode: impl Into<String>) -> BrokerResult<Self> {
        Ok(Self {
            uri: uri.parse()?,
            login: login.into(),
            passcode: passcode.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Cheaply cloneable handle that opens [`StompSession`]s.
#[derive(Debug, Clone)]
pub struct StompClient {
    config: Arc<StompConfig>,
}

impl StompClient {
    pub fn new(config: StompConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &StompConfig {
        &self.config
    }

    async fn connect_endpoint(&self, endpoint: &Endpoint) -> BrokerResult<StompSession> {
        let (framed, connected) =
            tokio::time::timeout(self.config.connect_timeout, self.handshake(endpoint))
                .await
                .map_err(|_| BrokerError::Timeout("CONNECTED"))??;

        tracing::info!(
            endpoint = %endpoint,
            version = connected.get("version").unwrap_or("1.0"),
            server = connected.get("server").unwrap_or("unknown"),
            "Connected to broker",
        );

        Ok(StompSession {
            framed,
            endpoint: endpoint.clone(),
            subscriptions: HashMap::new(),
            receipt_timeout: self.config.receipt_timeout,
        })
    }

    /// Open the TCP stream, send `CONNECT` and wait for `CONNECTED`.
    async fn handshake(
        &self,
        endpoint: &Endpoint,
    ) -> BrokerResult<(Framed<TcpStream, StompCodec>, Frame)> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, StompCodec::new());

        let connect = Frame::new(Command::Connect)
            .header("accept-version", STOMP_VERSION)
            .header("host", endpoint.host.as_str())
            .header("login", self.config.login.as_str())
            .header("passcode", self.config.passcode.as_str())
            .header("heart-beat", "0,0");
        framed.send(connect).await?;

        match framed.next().await {
            Some(Ok(frame)) if frame.command == Command::Connected => Ok((framed, frame)),
            Some(Ok(frame)) if frame.command == Command::Error => Err(rejected(&frame)),
            Some(Ok(frame)) => Err(BrokerError::Protocol(format!(
                "expected CONNECTED, got {}",
                frame.command.as_str()
            ))),
            Some(Err(e)) => Err(e),
            None => Err(BrokerError::Connection(
                "connection closed during handshake".into(),
            )),
        }
    }
}

#[async_trait]
impl Connector for StompClient {
    type Session = StompSession;

    async fn connect(&self) -> BrokerResult<StompSession> {
        let mut last_error = None;

        for endpoint in self.config.uri.connect_order() {
            match self.connect_endpoint(&endpoint).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Broker endpoint unavailable");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(BrokerError::Rejected { message, .. }) => {
                BrokerError::Connection(format!("broker refused the session: {message}"))
            }
            Some(e) => BrokerError::Connection(format!("all broker endpoints failed, last error: {e}")),
            None => BrokerError::Connection("no broker endpoints configured".into()),
        })
    }
}

/// Per-subscription state kept by the session.
#[derive(Debug)]
struct SubscriptionState {
    destination: String,
    error_destination: Option<String>,
}

/// A live STOMP connection.
pub struct StompSession {
    framed: Framed<TcpStream, StompCodec>,
    endpoint: Endpoint,
    subscriptions: HashMap<String, SubscriptionState>,
    receipt_timeout: Duration,
}

impl StompSession {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn message_from_frame(frame: Frame) -> BrokerResult<Message> {
        let message_id = frame
            .get("message-id")
            .ok_or_else(|| BrokerError::Protocol("MESSAGE without message-id".into()))?
            .to_string();
        let subscription = frame
            .get("subscription")
            .ok_or_else(|| BrokerError::Protocol("MESSAGE without subscription".into()))?
            .to_string();
        let destination = frame.get("destination").unwrap_or_default().to_string();
        let body = frame.body_text();

        Ok(Message::new(
            destination,
            body,
            frame.headers,
            AckToken::new(message_id, subscription),
        ))
    }

    fn ack_frame(command: Command, token: &AckToken) -> Frame {
        Frame::new(command)
            .header("message-id", token.message_id())
            .header("subscription", token.subscription())
    }
}

#[async_trait]
impl Session for StompSession {
    async fn subscribe(&mut self, destination: &str, options: SubscribeOptions) -> BrokerResult<()> {
        let frame = Frame::new(Command::Subscribe)
            .header("destination", destination)
            .header("id", options.id.as_str())
            .header("ack", options.ack.as_str())
            .header(PREFETCH_HEADER, options.prefetch.to_string());
        self.framed.send(frame).await?;

        tracing::info!(
            destination,
            id = %options.id,
            ack = options.ack.as_str(),
            prefetch = options.prefetch,
            "Subscribed",
        );

        self.subscriptions.insert(
            options.id,
            SubscriptionState {
                destination: destination.to_string(),
                error_destination: options.error_destination,
            },
        );
        Ok(())
    }

    async fn next_message(&mut self) -> BrokerResult<Option<Message>> {
        loop {
            let frame = match self.framed.next().await {
                Some(frame) => frame?,
                None => return Ok(None),
            };

            match frame.command {
                Command::Message => return Self::message_from_frame(frame).map(Some),
                Command::Error => return Err(rejected(&frame)),
                Command::Receipt => {
                    tracing::debug!(receipt = ?frame.get("receipt-id"), "Ignoring receipt");
                }
                other => {
                    tracing::warn!(command = other.as_str(), "Ignoring unexpected frame");
                }
            }
        }
    }

    async fn acknowledge(&mut self, token: AckToken) -> BrokerResult<()> {
        if !self.subscriptions.contains_key(token.subscription()) {
            return Err(BrokerError::UnknownSubscription(token.subscription().to_string()));
        }
        self.framed.send(Self::ack_frame(Command::Ack, &token)).await
    }

    async fn fail(&mut self, message: Message, reason: &str) -> BrokerResult<()> {
        let subscription = self
            .subscriptions
            .get(message.ack_token().subscription())
            .ok_or_else(|| {
                BrokerError::UnknownSubscription(message.ack_token().subscription().to_string())
            })?;

        let Some(error_destination) = subscription.error_destination.clone() else {
            tracing::warn!(
                destination = %subscription.destination,
                message_id = message.ack_token().message_id(),
                "No error destination, sending NACK",
            );
            let token = message.into_ack_token();
            return self.framed.send(Self::ack_frame(Command::Nack, &token)).await;
        };

        let mut forward = Frame::new(Command::Send).header("destination", error_destination.as_str());
        for (name, value) in &message.headers {
            if !DELIVERY_HEADERS.contains(&name.as_str()) {
                forward = forward.header(name.as_str(), value.as_str());
            }
        }
        forward = forward
            .header("original-destination", message.destination.as_str())
            .header("error-reason", reason)
            .body(message.body.as_bytes().to_vec());

        self.framed.send(forward).await?;
        tracing::info!(
            error_destination = %error_destination,
            message_id = message.ack_token().message_id(),
            "Forwarded failed message",
        );

        let token = message.into_ack_token();
        self.framed.send(Self::ack_frame(Command::Ack, &token)).await
    }

    async fn send(&mut self, destination: &str, body: &str) -> BrokerResult<()> {
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .body(body.as_bytes().to_vec());
        self.framed.send(frame).await
    }

    async fn disconnect(mut self) -> BrokerResult<()> {
        let receipt_id = uuid::Uuid::new_v4().to_string();
        self.framed
            .send(Frame::new(Command::Disconnect).header("receipt", receipt_id.as_str()))
            .await?;

        let wait_for_receipt = async {
            while let Some(frame) = self.framed.next().await {
                let frame = frame?;
                if frame.command == Command::Receipt
                    && frame.get("receipt-id") == Some(receipt_id.as_str())
                {
                    return Ok(());
                }
            }
            Ok::<(), BrokerError>(())
        };

        tokio::time::timeout(self.receipt_timeout, wait_for_receipt)
            .await
            .map_err(|_| BrokerError::Timeout("DISCONNECT receipt"))??;

        tracing::info!(endpoint = %self.endpoint, "Disconnected from broker");
        Ok(())
    }
}

fn rejected(frame: &Frame) -> BrokerError {
    BrokerError::Rejected {
        message: frame.get("message").unwrap_or("no message header").to_string(),
        details: frame.body_text(),
    }
}
