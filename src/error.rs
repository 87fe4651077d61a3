//! Error taxonomy for the control client.
//!
//! Every failure kind a caller may want to distinguish gets its own
//! variant; local validation errors never reach the network layer.

use thiserror::Error;

use crate::session::SessionState;

/// Errors produced by the transport, session, command and sequencer layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure (refused, reset, write on a closed stream).
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Connect retries exhausted without reaching the control endpoint.
    #[error("control endpoint {endpoint} unavailable after {attempts} attempts")]
    SessionUnavailable { endpoint: String, attempts: u32 },

    /// The capability handshake was rejected by the peer.
    #[error("capability negotiation rejected: {class}: {desc}")]
    Negotiation { class: String, desc: String },

    /// Malformed or unrecognized message on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the connection in the middle of a call.
    #[error("peer closed the connection mid-call")]
    Disconnected,

    /// The stream ended before a complete JSON document was seen.
    #[error("stream ended mid-message ({buffered} bytes buffered)")]
    TruncatedStream { buffered: usize },

    /// Local argument validation failed before any I/O happened.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A memory-dump response could not be decoded into bytes.
    #[error("malformed memory dump: {0}")]
    MalformedDump(String),

    /// The peer answered a command with an error descriptor.
    #[error("command failed: {class}: {desc}")]
    CommandFailed { class: String, desc: String },

    /// A plan step failed and abort-on-error is configured.
    #[error("sequence aborted at step {step}: {source}")]
    SequenceAborted {
        step: usize,
        #[source]
        source: Box<Error>,
    },

    /// An operation was attempted in the wrong session state.
    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
