//! Host repository.
//!
//! Hosts are indexed by oid (the primary key) and by owning socket. Both
//! indices live behind one lock so they can never disagree: a reader sees a
//! host in both or in neither.

use crate::error::{BrokerError, Result};
use crate::host::{HostEntity, SocketId};
use crate::ids::IdGenerator;
use rendezvous_relay::NetAddress;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Indices {
    by_oid: HashMap<String, HostEntity>,
    by_socket: HashMap<SocketId, String>,
}

impl Indices {
    fn insert(&mut self, host: HostEntity) -> Result<()> {
        if self.by_socket.contains_key(&host.socket) {
            return Err(BrokerError::DuplicateSocket(host.socket));
        }
        if self.by_oid.contains_key(&host.oid) {
            return Err(BrokerError::DuplicateOid(host.oid));
        }

        self.by_socket.insert(host.socket, host.oid.clone());
        self.by_oid.insert(host.oid.clone(), host);
        Ok(())
    }

    fn remove_oid(&mut self, oid: &str) -> Option<HostEntity> {
        let host = self.by_oid.remove(oid)?;
        self.by_socket.remove(&host.socket);
        Some(host)
    }
}

/// Registry of live hosts
#[derive(Default)]
pub struct HostRepository {
    indices: RwLock<Indices>,
}

impl HostRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a host.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DuplicateSocket`] if the socket already owns a
    /// host, or [`BrokerError::DuplicateOid`] if the oid is taken.
    pub fn add(&self, host: HostEntity) -> Result<()> {
        self.write().insert(host)
    }

    /// Create and insert a host with fresh identifiers for `socket`.
    ///
    /// A colliding oid is regenerated under the same lock, so the returned
    /// oid is unique among live hosts.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DuplicateSocket`] if the socket already owns a
    /// host.
    pub fn register(&self, socket: SocketId, ids: &IdGenerator) -> Result<HostEntity> {
        let mut indices = self.write();
        if indices.by_socket.contains_key(&socket) {
            return Err(BrokerError::DuplicateSocket(socket));
        }

        let mut oid = ids.oid();
        while indices.by_oid.contains_key(&oid) {
            oid = ids.oid();
        }

        let host = HostEntity::new(oid, ids.pid(), socket);
        indices.insert(host.clone())?;
        Ok(host)
    }

    /// Look up a host by oid
    #[must_use]
    pub fn find(&self, oid: &str) -> Option<HostEntity> {
        self.read().by_oid.get(oid).cloned()
    }

    /// Look up the host owned by a socket
    #[must_use]
    pub fn find_by_socket(&self, socket: SocketId) -> Option<HostEntity> {
        let indices = self.read();
        let oid = indices.by_socket.get(&socket)?;
        indices.by_oid.get(oid).cloned()
    }

    /// Look up a host by its private id
    #[must_use]
    pub fn find_by_pid(&self, pid: &str) -> Option<HostEntity> {
        self.read().by_oid.values().find(|host| host.pid == pid).cloned()
    }

    /// Record a host's external UDP address. Returns false if the oid is
    /// unknown.
    pub fn set_rinfo(&self, oid: &str, address: NetAddress) -> bool {
        match self.write().by_oid.get_mut(oid) {
            Some(host) => {
                host.rinfo = Some(address);
                true
            }
            None => false,
        }
    }

    /// Record the relay port assigned to a host. Returns false if the oid is
    /// unknown.
    pub fn set_relay(&self, oid: &str, port: u16) -> bool {
        match self.write().by_oid.get_mut(oid) {
            Some(host) => {
                host.relay = Some(port);
                true
            }
            None => false,
        }
    }

    /// Remove `host` if it is still registered.
    ///
    /// Removal only happens when the stored entry has the same oid and
    /// socket, so a stale copy cannot evict a newer registration. Removing
    /// an absent host is a no-op that returns false.
    pub fn remove_item(&self, host: &HostEntity) -> bool {
        let mut indices = self.write();
        let matches = indices
            .by_oid
            .get(&host.oid)
            .is_some_and(|stored| stored.socket == host.socket);

        matches && indices.remove_oid(&host.oid).is_some()
    }

    /// Remove whichever host the socket owns
    pub fn remove_by_socket(&self, socket: SocketId) -> Option<HostEntity> {
        let mut indices = self.write();
        let oid = indices.by_socket.get(&socket)?.clone();
        indices.remove_oid(&oid)
    }

    /// Number of registered hosts
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().by_oid.len()
    }

    /// Whether no host is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
