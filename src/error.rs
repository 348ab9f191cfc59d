//! Error taxonomy
//!
//! Every failure the routing core can report. Transient kinds are retried
//! internally before they reach a caller; once surfaced, the kind is kept
//! intact so an upstream layer can map it (e.g. to an HTTP status).

use crate::address::NodeAddress;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Routing-core errors
///
/// `Clone` so a single coalesced resolution can hand its outcome to every
/// waiting caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Invalid or empty configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Fewer than a majority of monitors answered.
    #[error("quorum unavailable: {responding} of {configured} monitors responded, {required} required")]
    QuorumUnavailable {
        responding: usize,
        configured: usize,
        required: usize,
    },

    /// Monitors answered but no primary reached a strict majority.
    #[error("no primary elected: {0}")]
    NoPrimaryElected(String),

    /// No pool slot freed up within the socket timeout.
    #[error("connection pool exhausted for {address}")]
    PoolExhausted { address: NodeAddress },

    /// A pooled connection failed at the I/O level (or turned out stale).
    #[error("broken connection to {address}: {reason}")]
    BrokenConnection { address: NodeAddress, reason: String },

    /// Malformed RESP from a peer
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The store rejected a command. Passed through unchanged.
    #[error("{0}")]
    Upstream(String),
}

impl Error {
    /// Build a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Build a broken-connection error
    pub fn broken(address: &NodeAddress, reason: impl std::fmt::Display) -> Self {
        Error::BrokenConnection {
            address: address.clone(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying (after a delay or a topology refresh) may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::QuorumUnavailable { .. }
                | Error::NoPrimaryElected(_)
                | Error::PoolExhausted { .. }
                | Error::BrokenConnection { .. }
        )
    }

    /// Whether the failure means the target node itself is unusable
    pub fn is_broken(&self) -> bool {
        matches!(self, Error::BrokenConnection { .. } | Error::Protocol(_))
    }

    /// Short stable name of the error kind, for logs and JSON bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "ConfigurationError",
            Error::QuorumUnavailable { .. } => "QuorumUnavailable",
            Error::NoPrimaryElected(_) => "NoPrimaryElected",
            Error::PoolExhausted { .. } => "PoolExhausted",
            Error::BrokenConnection { .. } => "BrokenConnection",
            Error::Protocol(_) => "ProtocolError",
            Error::Upstream(_) => "UpstreamIO",
        }
    }
}

impl From<crate::protocol::RespError> for Error {
    fn from(e: crate::protocol::RespError) -> Self {
        Error::Protocol(e.to_string())
    }
}
