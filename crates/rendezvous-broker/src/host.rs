//! Registered hosts.

use rendezvous_relay::NetAddress;
use std::fmt;

/// Identity of one control-channel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    /// Wrap a raw connection number
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw connection number
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Brokering state of a host, derived from its fields.
///
/// `connect` needs both parties in [`HostState::AddressKnown`]. Successful
/// brokering is a per-negotiation outcome and does not change the state; a
/// host may negotiate with any number of peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Has identifiers, external UDP address not learned yet
    Registered,
    /// External UDP address known
    AddressKnown,
}

/// One registered peer's control session
#[derive(Clone, PartialEq, Eq)]
pub struct HostEntity {
    /// Public object id, shared with other peers
    pub oid: String,
    /// Private id, only ever sent to the owning peer
    pub pid: String,
    /// Owning control connection
    pub socket: SocketId,
    /// Externally observed UDP address
    pub rinfo: Option<NetAddress>,
    /// Relay port assigned by the last relay negotiation
    pub relay: Option<u16>,
}

impl HostEntity {
    /// Create a host with no known address
    #[must_use]
    pub fn new(oid: String, pid: String, socket: SocketId) -> Self {
        Self {
            oid,
            pid,
            socket,
            rinfo: None,
            relay: None,
        }
    }

    /// Current brokering state
    #[must_use]
    pub fn state(&self) -> HostState {
        if self.rinfo.is_some() {
            HostState::AddressKnown
        } else {
            HostState::Registered
        }
    }
}

// pid is a bearer secret
impl fmt::Debug for HostEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEntity")
            .field("oid", &self.oid)
            .field("pid", &"<redacted>")
            .field("socket", &self.socket)
            .field("rinfo", &self.rinfo)
            .field("relay", &self.relay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_follows_rinfo() {
        let mut host = HostEntity::new("oid".into(), "pid".into(), SocketId::new(1));
        assert_eq!(host.state(), HostState::Registered);

        host.rinfo = Some("10.0.0.1:5000".parse().unwrap());
        assert_eq!(host.state(), HostState::AddressKnown);
    }

    #[test]
    fn test_debug_redacts_pid() {
        let host = HostEntity::new("public".into(), "very-secret".into(), SocketId::new(7));
        let debug = format!("{host:?}");

        assert!(debug.contains("public"));
        assert!(!debug.contains("very-secret"));
    }
}
