//! Broker capability traits.
//!
//! The dispatcher only depends on [`Connector`] and [`Session`]. The STOMP
//! client in [`crate::client`] is the production implementation; tests
//! provide in-memory ones.

use async_trait::async_trait;

use crate::error::BrokerResult;

/// Acknowledgment mode requested for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    Client,
    /// Each message is acknowledged on its own, independent of the others.
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Client => "client",
            Self::ClientIndividual => "client-individual",
        }
    }
}

/// Parameters for [`Session::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Subscription id, unique within the session.
    pub id: String,
    pub ack: AckMode,
    /// Maximum unacknowledged messages the broker may hand out at once.
    pub prefetch: u32,
    /// Where [`Session::fail`] forwards messages from this subscription.
    pub error_destination: Option<String>,
}

impl SubscribeOptions {
    /// Individually acknowledged subscription with a prefetch of one.
    pub fn client_individual(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ack: AckMode::ClientIndividual,
            prefetch: 1,
            error_destination: None,
        }
    }

    pub fn with_error_destination(mut self, destination: impl Into<String>) -> Self {
        self.error_destination = Some(destination.into());
        self
    }
}

/// Handle for settling one delivered message.
///
/// Deliberately neither `Clone` nor `Copy`: acknowledging or failing
/// consumes it, so a message can be settled at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct AckToken {
    message_id: String,
    subscription: String,
}

impl AckToken {
    pub fn new(message_id: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            subscription: subscription.into(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }
}

/// A message delivered on a subscription.
#[derive(Debug)]
pub struct Message {
    pub destination: String,
    pub body: String,
    /// All headers as received, in order.
    pub headers: Vec<(String, String)>,
    ack: AckToken,
}

impl Message {
    pub fn new(
        destination: impl Into<String>,
        body: impl Into<String>,
        headers: Vec<(String, String)>,
        ack: AckToken,
    ) -> Self {
        Self {
            destination: destination.into(),
            body: body.into(),
            headers,
            ack,
        }
    }

    pub fn ack_token(&self) -> &AckToken {
        &self.ack
    }

    /// Give up the message, keeping only what is needed to acknowledge it.
    pub fn into_ack_token(self) -> AckToken {
        self.ack
    }

    /// First value of header `name`, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    /// Establish a new, authenticated session.
    async fn connect(&self) -> BrokerResult<Self::Session>;
}

/// One live connection to the broker.
#[async_trait]
pub trait Session: Send {
    /// Subscribe to `destination`. Deliveries arrive through
    /// [`next_message`](Self::next_message).
    async fn subscribe(&mut self, destination: &str, options: SubscribeOptions)
        -> BrokerResult<()>;

    /// Wait for the next delivery. `Ok(None)` means the broker closed the
    /// connection.
    async fn next_message(&mut self) -> BrokerResult<Option<Message>>;

    /// Mark a message as successfully handled.
    async fn acknowledge(&mut self, token: AckToken) -> BrokerResult<()>;

    /// Mark a message as failed. With an error destination configured on
    /// its subscription, the message is forwarded there and acknowledged;
    /// otherwise it is negatively acknowledged.
    async fn fail(&mut self, message: Message, reason: &str) -> BrokerResult<()>;

    /// Publish `body` to `destination`.
    async fn send(&mut self, destination: &str, body: &str) -> BrokerResult<()>;

    /// Close the session gracefully.
    async fn disconnect(self) -> BrokerResult<()>
    where
        Self: Sized;
}
