//! Error types for the relay engine.

use crate::address::NetAddress;
use thiserror::Error;

/// Errors produced while creating, pairing or parsing relays.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No local UDP port is left for a new relay entry
    #[error("Relay pool exhausted: no free UDP port available")]
    PoolExhausted,

    /// Malformed address data
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// No live relay entry exists for the address
    #[error("No relay registered for {0}")]
    UnknownRelay(NetAddress),

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether a later attempt may succeed without operator intervention.
    ///
    /// Pool exhaustion clears as idle relays are swept; unknown relays can be
    /// recreated by the peer.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PoolExhausted | Self::UnknownRelay(_))
    }
}

/// Result alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
