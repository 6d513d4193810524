//! Canonical error types for the crate.
//!
//! Errors are split by how they propagate: framing errors are recovered at
//! the endpoint, transport errors drive the port reconnect state machine,
//! configuration errors are returned synchronously to the caller, and
//! connection errors report caller-requested cancellation.

use std::io;

use thiserror::Error;

/// Malformed frame detected while decoding a byte stream.
///
/// Framing errors never tear down an endpoint. The parser resets and the
/// byte stream continues.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The first byte of the frame is not the protocol sync byte.
    #[error("bad sync byte: expected {expected:#04x}, got {actual:#04x}")]
    BadSync {
        /// Sync byte required by the protocol.
        expected: u8,
        /// Byte found at the start of the frame.
        actual: u8,
    },

    /// No message factory is registered for the frame identifier.
    #[error("unsupported message id {id} for protocol {protocol}")]
    UnsupportedId {
        /// Protocol identifier.
        protocol: String,
        /// Identifier read from the frame.
        id: String,
    },

    /// Buffer is shorter than the frame it claims to contain.
    #[error("frame too short: have {have} bytes, need {need}")]
    TooShort {
        /// Bytes available.
        have: usize,
        /// Bytes required.
        need: usize,
    },

    /// Trailing checksum disagrees with the computed one.
    #[error("frame checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum computed from the frame contents.
        expected: u8,
        /// Checksum carried by the frame.
        actual: u8,
    },

    /// Frame identifier does not match the message being decoded.
    #[error("frame carries id {actual}, message expects {expected}")]
    IdMismatch {
        /// Identifier of the target message.
        expected: u8,
        /// Identifier found in the frame.
        actual: u8,
    },

    /// Payload does not fit the one-byte length field.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Payload size requested.
        size: usize,
        /// Largest encodable payload.
        max: usize,
    },

    /// Payload bytes do not describe a valid message body.
    #[error("invalid payload for {message}: {reason}")]
    InvalidPayload {
        /// Name of the message being decoded.
        message: &'static str,
        /// Human readable cause.
        reason: String,
    },
}

/// Failure of the physical link underneath a port.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An I/O call on the link failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the link.
    #[error("link closed by peer")]
    Closed,

    /// The transport cannot be used as configured (for example a missing
    /// driver feature).
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Invalid connection string or query parameter.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No port factory is registered for the scheme.
    #[error("port scheme not found: {0}")]
    UnknownScheme(String),

    /// The connection string is not of the form `scheme://...`.
    #[error("malformed connection string: {0}")]
    Malformed(String),

    /// The connection string lacks a host.
    #[error("connection string {0} has no host")]
    MissingHost(String),

    /// The connection string lacks a port number.
    #[error("connection string {0} has no port")]
    MissingPort(String),

    /// A query value is not a valid integer.
    #[error("parameter {key}: invalid integer {value:?}")]
    InvalidInteger {
        /// Query key.
        key: String,
        /// Rejected value.
        value: String,
    },

    /// A query value is not a valid boolean.
    #[error("parameter {key}: invalid boolean {value:?}")]
    InvalidBool {
        /// Query key.
        key: String,
        /// Rejected value.
        value: String,
    },

    /// A query value is not one of the accepted names.
    #[error("parameter {key}: invalid value {value:?}, expected one of {expected}")]
    InvalidEnum {
        /// Query key.
        key: String,
        /// Rejected value.
        value: String,
        /// Accepted names, comma separated.
        expected: &'static str,
    },

    /// A port with the same identifier is already registered.
    #[error("port {0} already exists")]
    DuplicatePort(String),
}

/// Error returned from [`crate::Connection::send`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The caller's cancellation token fired before transmission.
    #[error("send cancelled")]
    Cancelled,

    /// The message could not be serialised.
    #[error("encode error: {0}")]
    Encode(#[from] FramingError),

    /// The link rejected the write.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ConnectionError {
    /// Returns true if the error was caused by caller cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }
}

/// Error published on a connection's error stream.
///
/// The source identifies the connection (endpoint, port or router id) the
/// failure was observed on.
#[derive(Debug, Error)]
#[error("{source_id}: {kind}")]
pub struct LinkError {
    /// Identifier of the connection reporting the error.
    pub source_id: String,
    /// What went wrong.
    pub kind: LinkErrorKind,
}

/// Category of a [`LinkError`].
#[derive(Debug, Error)]
pub enum LinkErrorKind {
    /// A frame failed to decode.
    #[error(transparent)]
    Framing(#[from] FramingError),
    /// The link failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Sending to one endpoint failed.
    #[error(transparent)]
    Send(#[from] ConnectionError),
}

impl LinkError {
    /// Build a link error for `source_id`.
    pub fn new(source_id: impl Into<String>, kind: impl Into<LinkErrorKind>) -> Self {
        Self {
            source_id: source_id.into(),
            kind: kind.into(),
        }
    }
}

/// Result alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
