//! Error taxonomy shared by the agent, session and bus layers
//!
//! Kinds, not bare types: callers match on the variant to decide whether
//! an error terminates a connection, a session, or nothing at all.
//! Per-connection errors close that connection only; session errors leave
//! the agent alive; bus dispatch failures unsubscribe the offending
//! subscriber.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Cooperative shutdown; never surfaced to the peer.
    #[error("operation cancelled")]
    Cancelled,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Encoder pipe failed to start or died mid-stream; the session
    /// transitions to Failed and is not restarted at this layer.
    #[error("encoder error: {0}")]
    Encoder(String),

    /// Concurrent `start` on a running session; recovered by the caller.
    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("timeout: {0}")]
    Timeout(&'static str),

    #[error("external tool missing: {0}")]
    ExternalToolMissing(String),

    /// Frame too large, malformed header, bad magic: the offending
    /// connection is closed immediately with no recovery attempt.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
