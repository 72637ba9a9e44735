use std::net::SocketAddr;
use thiserror::Error;

/// Result type used throughout the membership layer
pub type Result<T> = std::result::Result<T, GridError>;

/// Errors raised by the membership layer
#[derive(Debug, Error)]
pub enum GridError {
    /// A socket could not be bound (port in use)
    #[error("Failed to bind {addr}: {message}")]
    Bind { addr: SocketAddr, message: String },

    /// The operation is not allowed in the current state (e.g. a second
    /// locator in one process)
    #[error("Illegal state: {0}")]
    State(String),

    /// No locator or coordinator could be reached within the join timeout
    #[error("Unable to connect to the cluster: {0}")]
    Connect(String),

    /// Malformed or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The local member was forced out of the cluster
    #[error("Forced disconnect: {0}")]
    ForcedDisconnect(String),

    /// An in-flight operation failed; the source tells why
    #[error("Operation failed: {source}")]
    OperationFailed {
        #[source]
        source: Box<GridError>,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt state: {0}")]
    Corruption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GridError {
    /// Wrap an error as the cause of a failed operation
    pub fn operation_failed(source: GridError) -> Self {
        GridError::OperationFailed {
            source: Box::new(source),
        }
    }

    /// True when this error, or the cause it wraps, is a forced disconnect
    pub fn is_forced_disconnect(&self) -> bool {
        self.forced_disconnect_cause().is_some()
    }

    /// The forced-disconnect reason carried by this error, looking through
    /// `OperationFailed` wrappers
    pub fn forced_disconnect_cause(&self) -> Option<&str> {
        match self {
            GridError::ForcedDisconnect(reason) => Some(reason),
            GridError::OperationFailed { source } => source.forced_disconnect_cause(),
            _ => None,
        }
    }

    /// Errors worth retrying from the caller's point of view
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GridError::Connect(_) | GridError::Timeout(_) | GridError::Network(_)
        )
    }
}
