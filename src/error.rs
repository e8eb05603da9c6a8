//! Error taxonomy shared by the schema registry, the codec, the connection
//! manager and the call dispatcher.
//!
//! Connection-level failures (`Bind`, `Dial`, `CredentialLoad`) are fatal only to the
//! connection attempt that produced them. Per-call failures reported by the
//! server arrive as [`Error::Remote`] and never tear down the connection.

use std::fmt;
use std::io;

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a dial attempt failed. Callers use this to decide whether a retry makes sense.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DialErrorKind {
    /// The address could not be resolved or no route to it exists (includes connect timeouts).
    Unreachable,
    /// The peer actively refused the TCP connection.
    Refused,
    /// TCP succeeded but session negotiation or the TLS handshake failed.
    Handshake,
}

impl fmt::Display for DialErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialErrorKind::Unreachable => f.write_str("unreachable"),
            DialErrorKind::Refused => f.write_str("refused"),
            DialErrorKind::Handshake => f.write_str("handshake-failed"),
        }
    }
}

/// Status carried by a failed reply. The discriminants are the wire values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum RemoteStatus {
    /// No handler is bound for the requested method, or the method is not in the server schema
    UnimplementedMethod = 1,
    /// The request payload could not be decoded with the method's request schema
    InvalidArgument = 2,
    /// The handler reported a failure (or panicked)
    HandlerFailed = 3,
    /// The handler stopped because it observed cancellation
    CancellationObserved = 4,
    /// The server does not speak the call frame version used by the client
    ProtocolMismatch = 5,
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RemoteStatus::UnimplementedMethod => "unimplemented method",
            RemoteStatus::InvalidArgument => "invalid argument",
            RemoteStatus::HandlerFailed => "handler failed",
            RemoteStatus::CancellationObserved => "cancellation observed",
            RemoteStatus::ProtocolMismatch => "protocol mismatch",
        };
        f.write_str(label)
    }
}

/// A per-call failure reported by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteError {
    pub status: RemoteStatus,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: RemoteStatus, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{}: {}", self.status, self.message)
        }
    }
}

impl std::error::Error for RemoteError {}

/// Failures of the message codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("input truncated")]
    Truncated,
    #[error("field {number} of {message} has wire kind {found}, schema expects {expected}")]
    WireKindMismatch { message: String, number: u32, expected: u32, found: u32 },
    #[error("field {number} of {message} occurs more than once")]
    DuplicateField { message: String, number: u32 },
    #[error("unknown wire kind {0}")]
    UnknownWireKind(u32),
    #[error("invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("field {field} of {message} does not accept {found} values")]
    TypeMismatch { message: String, field: String, found: &'static str },
    #[error("message {message} has no field named {field}")]
    UnknownField { message: String, field: String },
    #[error("message type {0} is not defined")]
    UnknownMessageType(String),
    #[error("message nesting exceeds {0} levels")]
    TooDeep(usize),
    #[error("encoded frame of {size} bytes exceeds the {limit} byte record limit")]
    RecordTooLarge { size: usize, limit: usize },
    #[error("{0}")]
    Io(String),
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => CodecError::Truncated,
            _ => CodecError::Io(e.to_string()),
        }
    }
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error("schema parse error at line {line}: {message}")]
    SchemaParse { line: usize, message: String },

    #[error("message type {0} is not defined")]
    UnknownType(String),

    #[error("service {0} is not defined")]
    UnknownService(String),

    #[error("method {service}/{method} is not defined")]
    UnknownMethod { service: String, method: String },

    #[error("a handler is already bound for {service}/{method}")]
    HandlerAlreadyBound { service: String, method: String },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("credential load error: {0}")]
    CredentialLoad(String),

    #[error("cannot bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot dial {address} ({kind}): {message}")]
    Dial { address: String, kind: DialErrorKind, message: String },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("remote error: {0}")]
    Remote(RemoteError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl Error {
    pub(crate) fn dial(address: &str, kind: DialErrorKind, message: impl fmt::Display) -> Self {
        Error::Dial { address: address.to_string(), kind, message: message.to_string() }
    }

    /// Short kind label, used when reporting startup failures.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::SchemaConflict(_) => "SchemaConflict",
            Error::SchemaParse { .. } => "SchemaParse",
            Error::UnknownType(_) => "UnknownType",
            Error::UnknownService(_) => "UnknownService",
            Error::UnknownMethod { .. } => "UnknownMethod",
            Error::HandlerAlreadyBound { .. } => "HandlerAlreadyBound",
            Error::Codec(_) => "CodecError",
            Error::CredentialLoad(_) => "CredentialLoadError",
            Error::Bind { .. } => "BindError",
            Error::Dial { .. } => "DialError",
            Error::DeadlineExceeded => "DeadlineExceeded",
            Error::ConnectionClosed => "ConnectionClosed",
            Error::Remote(_) => "RemoteError",
            Error::Transport(_) => "TransportError",
        }
    }

    /// Returns the dial failure kind, if this is a dial error.
    pub fn dial_kind(&self) -> Option<DialErrorKind> {
        match self {
            Error::Dial { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns the remote status, if the server reported a per-call failure.
    pub fn remote_status(&self) -> Option<RemoteStatus> {
        match self {
            Error::Remote(remote) => Some(remote.status),
            _ => None,
        }
    }
}
