//! Error types for brokering and the control server
//!
//! Every [`BrokerError`] raised by a command handler is recovered at the
//! dispatcher and sent back to the issuing peer as a failure reply; none of
//! them stop the server. [`ServerError`] covers start-up failures only.

use crate::host::SocketId;
use rendezvous_relay::RelayError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised while brokering a command
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Referenced oid has no registered host
    #[error("Unknown host oid: {0}")]
    UnknownHost(String),

    /// Issuing socket has not registered
    #[error("Unknown client: socket has not registered")]
    UnknownCaller,

    /// Registration datagram carried a pid no host owns
    #[error("Unknown pid")]
    UnknownPid,

    /// Required remote address not known yet (`"host"` or `"caller"`)
    #[error("No remote address registered for {0}")]
    UnknownAddress(&'static str),

    /// No relay port left
    #[error("Relay pool exhausted")]
    RelayPoolExhausted,

    /// Malformed address data
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Repository insert for a socket that already owns a host
    #[error("Socket {0} already owns a host")]
    DuplicateSocket(SocketId),

    /// Repository insert for an oid that is already registered
    #[error("Host oid already registered: {0}")]
    DuplicateOid(String),

    /// Command is missing a required parameter
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    /// No handler for the command name
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Other relay engine failure
    #[error("Relay error: {0}")]
    Relay(String),
}

impl BrokerError {
    /// Short label for metrics and structured logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownHost(_) => "unknown_host",
            Self::UnknownCaller => "unknown_caller",
            Self::UnknownPid => "unknown_pid",
            Self::UnknownAddress(_) => "unknown_address",
            Self::RelayPoolExhausted => "relay_pool_exhausted",
            Self::InvalidAddress(_) => "invalid_address",
            Self::DuplicateSocket(_) => "duplicate_socket",
            Self::DuplicateOid(_) => "duplicate_oid",
            Self::MissingParameter(_) => "missing_parameter",
            Self::UnknownCommand(_) => "unknown_command",
            Self::Relay(_) => "relay_error",
        }
    }

    /// Internal invariant violations that peers cannot trigger through the
    /// protocol
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::DuplicateSocket(_) | Self::DuplicateOid(_))
    }
}

impl From<RelayError> for BrokerError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::PoolExhausted => Self::RelayPoolExhausted,
            RelayError::InvalidAddress(msg) => Self::InvalidAddress(msg),
            other => Self::Relay(other.to_string()),
        }
    }
}

/// Result alias for brokering operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors starting the control server
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener or registrar socket could not be bound
    #[error("Failed to bind {what} on {addr}: {source}")]
    Bind {
        /// Which socket failed
        what: &'static str,
        /// Requested address
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Other socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
