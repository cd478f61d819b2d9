use postproc_broker::BrokerError;

/// A worker process could not be started.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Worker executable not found: {0}")]
    NotFound(String),

    #[error("Permission denied starting worker: {0}")]
    PermissionDenied(String),

    #[error("Failed to start worker {executable}: {source}")]
    Io {
        executable: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    pub fn from_io(executable: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(executable.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(executable.to_string()),
            _ => Self::Io {
                executable: executable.to_string(),
                source: err,
            },
        }
    }
}

/// Handling a single message failed; the message goes to the error destination.
#[derive(Debug, thiserror::Error)]
pub enum HandlingError {
    #[error("Message has no destination header")]
    MissingDestination,

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// A heartbeat could not be published. Logged and otherwise ignored.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Could not encode heartbeat: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Could not connect to broker: {0}")]
    Connect(#[source] BrokerError),

    #[error("Could not publish heartbeat: {0}")]
    Publish(#[source] BrokerError),

    #[error("Could not close heartbeat connection: {0}")]
    Disconnect(#[source] BrokerError),
}
