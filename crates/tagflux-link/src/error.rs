use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the session and acquisition layer.
///
/// Connectivity and per-item failures are normally absorbed into state and
/// events rather than returned; what does come back to a caller is either a
/// soft failure that is safe to retry (gate timeout, connect failure) or a
/// configuration-contract violation.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("gate timeout after {waited:?} waiting to {op}")]
    GateTimeout { op: &'static str, waited: Duration },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("not connected")]
    NotConnected,

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation cancelled")]
    Cancelled,
}
