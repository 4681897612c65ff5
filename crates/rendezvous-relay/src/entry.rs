//! Relay entries.

use crate::address::NetAddress;
use std::time::{Duration, Instant};

/// One peer's relay leg: the peer's external address and the local port
/// that represents it on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    /// Peer's externally observed address
    pub address: NetAddress,
    /// Locally bound UDP port
    pub port: u16,
    /// Last time a datagram was forwarded for this entry
    pub last_active_at: Instant,
    /// Entry is swept once this instant is reached
    pub expires_at: Instant,
}

impl RelayEntry {
    /// Create an entry that expires `ttl` after `now`
    #[must_use]
    pub fn new(address: NetAddress, port: u16, now: Instant, ttl: Duration) -> Self {
        Self {
            address,
            port,
            last_active_at: now,
            expires_at: now + ttl,
        }
    }

    /// Record activity and slide the expiry forward
    pub fn touch(&mut self, now: Instant, ttl: Duration) {
        self.last_active_at = now;
        self.expires_at = now + ttl;
    }

    /// Check if the entry has expired at `now`
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Check if the entry is still live at `now`
    #[must_use]
    pub fn is_alive(&self, now: Instant) -> bool {
        !self.is_expired(now)
    }
}
