//! Error taxonomy for the connection core.
//!
//! Two families, matching who observes them:
//!
//! - [`ConnectionError`] — fatal conditions surfaced by [`establish`] and
//!   `Driver::run`. A handshake error is never retried internally.
//! - [`CallError`] — per-operation failures surfaced to handle callers. A
//!   close-reason error carries the original reason so the application can
//!   tell "I closed this" from "the peer/transport closed this".
//!
//! [`establish`]: crate::establish

use std::io;
use std::sync::Arc;

use warren_wire::{ChannelId, CloseReason, ProtocolVersion};

/// Fatal connection-level error.
#[derive(Debug)]
pub enum ConnectionError {
    /// Transport-level read or write failure.
    Io(io::Error),
    /// The peer answered our protocol header with a different one.
    VersionMismatch {
        ours: ProtocolVersion,
        theirs: ProtocolVersion,
    },
    /// None of the peer's authentication mechanisms work with the configured
    /// credentials.
    NoUsableAuthMechanism { mechanisms: String },
    /// The peer refused the connection during the handshake.
    Refused(CloseReason),
    /// A frame arrived that no handler could accept: an unknown channel
    /// number, or a reply outside the acceptable set of an outstanding call.
    UnexpectedFrame {
        channel: ChannelId,
        context: String,
    },
    /// The transport closed before the exchange completed.
    Closed,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {e}"),
            ConnectionError::VersionMismatch { ours, theirs } => {
                write!(f, "protocol version mismatch: sent {ours}, peer speaks {theirs}")
            }
            ConnectionError::NoUsableAuthMechanism { mechanisms } => {
                write!(f, "no usable authentication mechanism among [{mechanisms}]")
            }
            ConnectionError::Refused(reason) => {
                write!(f, "connection refused by peer: {reason}")
            }
            ConnectionError::UnexpectedFrame { channel, context } => {
                write!(f, "unexpected frame on channel {channel}: {context}")
            }
            ConnectionError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// Error from an operation on a connection or channel handle.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The connection has a recorded close reason.
    ConnectionClosed(Arc<CloseReason>),
    /// The channel has a recorded close reason.
    ChannelClosed(Arc<CloseReason>),
    /// Every channel number up to the negotiated maximum is in use. The
    /// caller may release channels and retry.
    NoFreeChannels,
    /// The driver task stopped without recording a close reason.
    DriverGone,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::ConnectionClosed(reason) => write!(f, "connection closed: {reason}"),
            CallError::ChannelClosed(reason) => write!(f, "channel closed: {reason}"),
            CallError::NoFreeChannels => write!(f, "no free channel numbers"),
            CallError::DriverGone => write!(f, "driver task stopped"),
        }
    }
}

impl std::error::Error for CallError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_errors_carry_the_reason() {
        let reason = Arc::new(CloseReason::new(320, "CONNECTION_FORCED"));
        let err = CallError::ConnectionClosed(reason.clone());
        match err {
            CallError::ConnectionClosed(r) => assert!(Arc::ptr_eq(&r, &reason)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn display_is_informative() {
        let err = ConnectionError::VersionMismatch {
            ours: warren_wire::PROTOCOL_VERSION,
            theirs: ProtocolVersion {
                major: 1,
                minor: 0,
                revision: 0,
            },
        };
        let rendered = err.to_string();
        assert!(rendered.contains("0-9-1"));
        assert!(rendered.contains("1-0-0"));
    }
}
