//! Shared brokering state.

use crate::dispatch::{Dispatcher, Exchange};
use crate::error::{BrokerError, Result};
use crate::host::{HostEntity, SocketId};
use crate::ids::IdGenerator;
use crate::metrics;
use crate::repository::HostRepository;
use rendezvous_relay::{NetAddress, RelayEngine};

/// Host registry, relay engine and command table shared by every connection
pub struct Broker {
    hosts: HostRepository,
    relays: RelayEngine,
    ids: IdGenerator,
    dispatcher: Dispatcher,
}

impl Broker {
    /// Compose a broker from its parts
    #[must_use]
    pub fn new(relays: RelayEngine, ids: IdGenerator, dispatcher: Dispatcher) -> Self {
        Self {
            hosts: HostRepository::new(),
            relays,
            ids,
            dispatcher,
        }
    }

    /// Registered hosts
    #[must_use]
    pub fn hosts(&self) -> &HostRepository {
        &self.hosts
    }

    /// Relay engine
    #[must_use]
    pub fn relays(&self) -> &RelayEngine {
        &self.relays
    }

    /// Identifier source
    #[must_use]
    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    /// Dispatch one incoming command
    pub fn handle(&self, exchange: &Exchange<'_>) {
        self.dispatcher.dispatch(exchange, self);
    }

    /// Tear down whatever the closed connection owned
    pub fn disconnected(&self, socket: SocketId) -> Option<HostEntity> {
        let host = self.hosts.remove_by_socket(socket)?;
        tracing::info!(oid = %host.oid, %socket, "Host disconnected");
        metrics::set_active_hosts(self.hosts.len());
        Some(host)
    }

    /// Bind the host owning `pid` to the UDP address it was seen from.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownPid`] if no live host owns `pid`.
    pub fn register_remote(&self, pid: &str, address: NetAddress) -> Result<HostEntity> {
        let mut host = self.hosts.find_by_pid(pid).ok_or(BrokerError::UnknownPid)?;
        if !self.hosts.set_rinfo(&host.oid, address) {
            // disconnected between lookup and update
            return Err(BrokerError::UnknownPid);
        }

        host.rinfo = Some(address);
        Ok(host)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(dispatcher: Dispatcher) -> Self {
        use rendezvous_relay::{RelayConfig, RelayPorts};

        let relays = RelayEngine::new(RelayConfig {
            bind_ip: "127.0.0.1".parse().unwrap(),
            ports: RelayPorts::Auto { max_slots: 16 },
            ..RelayConfig::default()
        });
        Self::new(relays, IdGenerator::default(), dispatcher)
    }
}
