//! Error types for the RPC channel runtime.

use crate::connection::ConnectionState;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC channel operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Establishing or using a transport connection failed.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Framing or protocol-level errors.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Encoding or decoding a request/response body failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] CodecError),

    /// The remote side (or a local push handler) reported a failure.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// No response arrived before the invocation deadline.
    #[error("RPC timed out after {0:?}")]
    Timeout(Duration),

    /// The connection carrying the invocation was torn down.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Every pooled connection slot for an instance is in use.
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error is an invocation deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether this error means the carrying connection went away.
    #[must_use]
    pub const fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// Connection-specific errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to establish connection.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The transport connect did not finish in time.
    #[error("Connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// The address we tried to connect to.
        addr: SocketAddr,
        /// Configured connect timeout.
        timeout: Duration,
    },

    /// Host and port do not resolve to a socket address.
    #[error("Invalid address {0}")]
    InvalidAddress(String),

    /// Operation requires a connected channel.
    #[error("Connection is not usable in state {0:?}")]
    NotConnected(ConnectionState),

    /// The server rejected or never answered the push registration.
    #[error("Push registration failed: {0}")]
    RegistrationFailed(String),
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Invalid frame received.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Checksum mismatch.
    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Frame kind is not valid in this direction.
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// Push operation requested on a protocol without push support.
    #[error("Protocol {0} does not support server push")]
    PushUnsupported(&'static str),
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),
}

/// Handler errors, local (push handlers) or reported by the remote side.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No push handler registered for the method.
    #[error("No handler registered for {service}.{method}")]
    NotFound {
        /// Service name of the call.
        service: String,
        /// Method name of the call.
        method: String,
    },

    /// Handler returned an error.
    #[error("Handler error: {0}")]
    Internal(String),

    /// Error carried back in a response frame.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Error code for categorization.
        code: String,
        /// Human-readable error message.
        message: String,
    },
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
