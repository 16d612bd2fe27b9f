//! Session-level error taxonomy
//!
//! A closed set of error kinds so callers can branch on what went wrong
//! instead of parsing message strings.

use thiserror::Error;

/// Errors surfaced by sharing sessions and their components
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShareError {
    /// The signaling relay could not be reached, or the connection dropped
    /// and could not be restored.
    #[error("signaling unreachable: {0}")]
    SignalingUnreachable(String),

    /// WebRTC negotiation failed to produce an open data channel.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The session code was valid once but its TTL has elapsed.
    #[error("session expired")]
    SessionExpired,

    /// No session exists for the given code.
    #[error("session not found")]
    SessionNotFound,

    /// A bounded wait elapsed (counterpart never joined, or the whole
    /// session ran past its deadline).
    #[error("transfer timed out: {0}")]
    TransferTimeout(String),

    /// The data channel errored or closed while a file was in flight.
    #[error("data channel error: {0}")]
    DataChannelError(String),
}
