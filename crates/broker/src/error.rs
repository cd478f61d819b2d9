/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised while talking to the message broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or refused the session.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker answered with an `ERROR` frame.
    #[error("Broker error: {message}")]
    Rejected { message: String, details: String },

    /// A frame violated the STOMP protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The broker address could not be parsed.
    #[error("Invalid broker URI: {0}")]
    InvalidUri(String),

    /// An acknowledgment referred to a subscription this session never made.
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
