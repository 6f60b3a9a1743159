// src/core/errors.rs

//! Defines the primary error type for the client.

use std::sync::Arc;
use thiserror::Error;

/// A convenience alias used throughout the client.
pub type Result<T> = std::result::Result<T, ClientError>;

/// The main error enum, representing every failure a caller can observe.
///
/// The variants map onto four externally distinguishable causes (see
/// [`ErrorKind`]): a TLS handshake failure, a protocol violation on the wire,
/// a closed connection and a caller-side timeout. Everything else is grouped
/// under [`ErrorKind::Other`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// Internal signal from the decoder that a frame is not yet complete.
    /// It never leaves the codec.
    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Command timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An error reply (`-ERR ...`) sent by the server for a single command.
    #[error("{0}")]
    Server(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Command not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("No live connection available in the pool")]
    NoConnectionAvailable,

    #[error("Connection pool has been shut down")]
    PoolShutdown,
}

/// A coarse classification of a [`ClientError`], used by callers deciding
/// whether to retry a command on a freshly acquired connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Handshake,
    Protocol,
    Closed,
    Timeout,
    Other,
}

impl ClientError {
    /// Returns the cause category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Handshake(_) => ErrorKind::Handshake,
            ClientError::Protocol(_) => ErrorKind::Protocol,
            ClientError::ConnectionClosed(_) | ClientError::PoolShutdown => ErrorKind::Closed,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Other,
        }
    }

    /// Shorthand for a connection-closed error with the given reason.
    pub fn closed(reason: impl Into<String>) -> Self {
        ClientError::ConnectionClosed(reason.into())
    }

    /// Returns `true` if a command that failed with this error may be retried
    /// on another connection without risk of having been applied twice.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Handshake | ErrorKind::Closed)
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// A single close cause is fanned out to every pending command, so the error
// must be cheap to duplicate.
impl Clone for ClientError {
    fn clone(&self) -> Self {
        match self {
            ClientError::Io(e) => ClientError::Io(Arc::clone(e)),
            ClientError::IncompleteData => ClientError::IncompleteData,
            ClientError::Handshake(s) => ClientError::Handshake(s.clone()),
            ClientError::Tls(s) => ClientError::Tls(s.clone()),
            ClientError::Protocol(s) => ClientError::Protocol(s.clone()),
            ClientError::ConnectionClosed(s) => ClientError::ConnectionClosed(s.clone()),
            ClientError::Timeout(d) => ClientError::Timeout(*d),
            ClientError::Server(s) => ClientError::Server(s.clone()),
            ClientError::Config(s) => ClientError::Config(s.clone()),
            ClientError::Codec(s) => ClientError::Codec(s.clone()),
            ClientError::InvalidState(s) => ClientError::InvalidState(s.clone()),
            ClientError::NoConnectionAvailable => ClientError::NoConnectionAvailable,
            ClientError::PoolShutdown => ClientError::PoolShutdown,
        }
    }
}

impl PartialEq for ClientError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ClientError::Io(e1), ClientError::Io(e2)) => e1.to_string() == e2.to_string(),
            (ClientError::Handshake(s1), ClientError::Handshake(s2)) => s1 == s2,
            (ClientError::Tls(s1), ClientError::Tls(s2)) => s1 == s2,
            (ClientError::Protocol(s1), ClientError::Protocol(s2)) => s1 == s2,
            (ClientError::ConnectionClosed(s1), ClientError::ConnectionClosed(s2)) => s1 == s2,
            (ClientError::Timeout(d1), ClientError::Timeout(d2)) => d1 == d2,
            (ClientError::Server(s1), ClientError::Server(s2)) => s1 == s2,
            (ClientError::Config(s1), ClientError::Config(s2)) => s1 == s2,
            (ClientError::Codec(s1), ClientError::Codec(s2)) => s1 == s2,
            (ClientError::InvalidState(s1), ClientError::InvalidState(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}

impl From<rustls::Error> for ClientError {
    fn from(e: rustls::Error) -> Self {
        ClientError::Tls(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Codec(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for ClientError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        ClientError::Codec(format!("invalid UTF-8 payload: {e}"))
    }
}
