// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for extend-client operations.
//!
//! Every failure names what failed: the resource, the operation, or the
//! numeric context (timeout, requested vs. actual buffer size).

use std::fmt;
use std::io;

/// Result type for extend-client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller passed something this layer refuses to act on.
    Validation,
    /// A bounded wait expired.
    Timeout,
    /// Socket, framing or connection failure.
    Transport,
    /// Operation not valid in the current lifecycle state.
    State,
    /// The proxy answered with a failure.
    Remote,
    /// Invalid or unreadable configuration.
    Config,
}

/// Errors raised by the socket, connection and service layers.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Validation Errors
    // ========================================================================
    /// Resource proxy does not belong to the service it was handed to.
    IllegalResource { kind: &'static str, name: String },
    /// Argument rejected before any network activity.
    IllegalArgument(String),
    /// No scope was passed and the calling thread has no context scope.
    MissingContextScope,
    /// Invocation queries targeting explicit members are not supported.
    DirectedQueryUnsupported,

    // ========================================================================
    // Timeout Errors
    // ========================================================================
    /// Per-name reference lock could not be acquired in time.
    Timeout { resource: String, waited_ms: u64 },
    /// No response arrived within the request timeout.
    RequestTimeout { operation: String, timeout_ms: u64 },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Generic transport failure (bad URI, unreachable proxy, ...).
    Transport(String),
    /// Malformed frame or message, or a message foreign to the protocol.
    Protocol(String),
    /// Negotiated socket buffer is below the configured minimum.
    BufferNegotiation {
        kind: &'static str,
        requested: usize,
        actual: usize,
        minimum: usize,
    },
    /// The connection or datagram socket was closed.
    ConnectionClosed,
    /// I/O error with underlying cause.
    Io(io::Error),

    // ========================================================================
    // State Errors
    // ========================================================================
    /// Stream or datagram operation on a socket that is not open.
    SocketClosed,
    /// Operation not allowed in the current state.
    InvalidState(String),
    /// Service was stopped (or never started).
    ServiceStopped(String),
    /// Blocking call was interrupted by a concurrent close.
    Interrupted(String),

    // ========================================================================
    // Remote / Config Errors
    // ========================================================================
    /// Proxy returned a failure response.
    Remote { code: u32, message: String },
    /// Invalid configuration.
    Config(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IllegalResource { .. }
            | Self::IllegalArgument(_)
            | Self::MissingContextScope
            | Self::DirectedQueryUnsupported => ErrorKind::Validation,
            Self::Timeout { .. } | Self::RequestTimeout { .. } => ErrorKind::Timeout,
            Self::Transport(_)
            | Self::Protocol(_)
            | Self::BufferNegotiation { .. }
            | Self::ConnectionClosed
            | Self::Io(_) => ErrorKind::Transport,
            Self::SocketClosed
            | Self::InvalidState(_)
            | Self::ServiceStopped(_)
            | Self::Interrupted(_) => ErrorKind::State,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether this is one of the timeout conditions.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub(crate) fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Duplicate an error for fan-out (pending requests failed by one I/O error).
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::IllegalResource { kind, name } => Self::IllegalResource {
                kind,
                name: name.clone(),
            },
            Self::IllegalArgument(s) => Self::IllegalArgument(s.clone()),
            Self::MissingContextScope => Self::MissingContextScope,
            Self::DirectedQueryUnsupported => Self::DirectedQueryUnsupported,
            Self::Timeout {
                resource,
                waited_ms,
            } => Self::Timeout {
                resource: resource.clone(),
                waited_ms: *waited_ms,
            },
            Self::RequestTimeout {
                operation,
                timeout_ms,
            } => Self::RequestTimeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            Self::Transport(s) => Self::Transport(s.clone()),
            Self::Protocol(s) => Self::Protocol(s.clone()),
            Self::BufferNegotiation {
                kind,
                requested,
                actual,
                minimum,
            } => Self::BufferNegotiation {
                kind,
                requested: *requested,
                actual: *actual,
                minimum: *minimum,
            },
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::SocketClosed => Self::SocketClosed,
            Self::InvalidState(s) => Self::InvalidState(s.clone()),
            Self::ServiceStopped(s) => Self::ServiceStopped(s.clone()),
            Self::Interrupted(s) => Self::Interrupted(s.clone()),
            Self::Remote { code, message } => Self::Remote {
                code: *code,
                message: message.clone(),
            },
            Self::Config(s) => Self::Config(s.clone()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalResource { kind, name } => {
                write!(f, "illegal {} '{}': not owned by this service", kind, name)
            }
            Self::IllegalArgument(msg) => write!(f, "illegal argument: {}", msg),
            Self::MissingContextScope => write!(f, "context scope missing"),
            Self::DirectedQueryUnsupported => {
                write!(f, "directed query not supported; member set must be None")
            }
            Self::Timeout {
                resource,
                waited_ms,
            } => write!(
                f,
                "failed to get a reference to resource '{}' after {}ms",
                resource, waited_ms
            ),
            Self::RequestTimeout {
                operation,
                timeout_ms,
            } => write!(f, "request '{}' timed out after {}ms", operation, timeout_ms),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::BufferNegotiation {
                kind,
                requested,
                actual,
                minimum,
            } => write!(
                f,
                "failed to set {} buffer size to {} bytes; actual size is {} bytes, below the minimum of {} bytes",
                kind, requested, actual, minimum
            ),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::SocketClosed => write!(f, "socket is closed"),
            Self::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Self::ServiceStopped(name) => write!(f, "service '{}' is not running", name),
            Self::Interrupted(what) => write!(f, "interrupted: {}", what),
            Self::Remote { code, message } => write!(f, "remote error {}: {}", code, message),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_resource_and_wait() {
        let err = Error::Timeout {
            resource: "orders".into(),
            waited_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "failed to get a reference to resource 'orders' after 250ms"
        );
        assert!(err.is_timeout());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(Error::DirectedQueryUnsupported.kind(), ErrorKind::Validation);
        assert_eq!(Error::SocketClosed.kind(), ErrorKind::State);
        assert_eq!(Error::ConnectionClosed.kind(), ErrorKind::Transport);
        assert_eq!(
            Error::Remote {
                code: 1,
                message: "x".into()
            }
            .kind(),
            ErrorKind::Remote
        );
    }

    #[test]
    fn test_buffer_message_carries_sizes() {
        let err = Error::BufferNegotiation {
            kind: "send",
            requested: 65536,
            actual: 4096,
            minimum: 16384,
        };
        let msg = err.to_string();
        assert!(msg.contains("65536"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("16384"));
    }

    #[test]
    fn test_duplicate_preserves_io_kind() {
        let err = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        match err.duplicate() {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected {:?}", other),
        }
    }
}
