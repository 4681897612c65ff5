//! Relay engine: owns relay entries, their UDP sockets, and forwarding.
//!
//! Every relay entry binds one local UDP port that represents its peer on the
//! server. Once two entries are paired, a datagram from one peer arriving on
//! either entry's port is sent on to the other peer *from the sender's own
//! relay port*, so each side always sees its counterpart as the same
//! `server:port` endpoint:
//!
//! ```text
//!   Peer A ──► server:pB ──┐            ┌──► Peer B
//!                          │  (from pA) │
//!                          └────────────┘
//!   Peer B ──► server:pA ──┐            ┌──► Peer A
//!                          │  (from pB) │
//!                          └────────────┘
//! ```
//!
//! Entries expire on a sliding TTL refreshed by forwarded traffic. The
//! periodic sweep is the only path that destroys entries.

use crate::address::NetAddress;
use crate::entry::RelayEntry;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::pool::{PortPool, RelayPorts};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Relay engine configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Local IP relay sockets bind to
    pub bind_ip: IpAddr,
    /// Port source for relay sockets
    pub ports: RelayPorts,
    /// Sliding expiry applied on creation and on every forwarded datagram
    pub ttl: Duration,
    /// How often expired entries are swept
    pub sweep_interval: Duration,
    /// Receive buffer size per relay port
    pub max_datagram_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: RelayPorts::default(),
            ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            max_datagram_size: 65535,
        }
    }
}

struct RelaySlot {
    entry: RelayEntry,
    socket: Arc<UdpSocket>,
    receiver: JoinHandle<()>,
    /// Paired counterparts, most recently paired last
    peers: Vec<NetAddress>,
}

struct RelayTable {
    slots: HashMap<NetAddress, RelaySlot>,
    ports: HashMap<u16, NetAddress>,
    pool: PortPool,
}

impl RelayTable {
    /// Remove an entry, close its socket, return its port and unpair it
    fn remove(&mut self, address: &NetAddress) -> Option<RelayEntry> {
        let slot = self.slots.remove(address)?;

        self.ports.remove(&slot.entry.port);
        slot.receiver.abort();
        self.pool.release(slot.entry.port);

        for peer in &slot.peers {
            if let Some(other) = self.slots.get_mut(peer) {
                other.peers.retain(|p| p != address);
            }
        }

        Some(slot.entry)
    }

    /// Decide where a datagram received on `port` from `from` goes.
    ///
    /// Refreshes both entries when the datagram is forwarded.
    fn route(
        &mut self,
        port: u16,
        from: NetAddress,
        now: Instant,
        ttl: Duration,
    ) -> std::result::Result<(Arc<UdpSocket>, NetAddress), &'static str> {
        let owner = *self.ports.get(&port).ok_or("closed_port")?;
        let sender = self.slots.get(&from).ok_or("unknown_source")?;

        if sender.entry.is_expired(now) {
            return Err("expired");
        }

        let destination = if from == owner {
            *sender.peers.last().ok_or("unpaired")?
        } else if sender.peers.contains(&owner) {
            owner
        } else {
            return Err("unpaired");
        };

        let socket = Arc::clone(&sender.socket);

        match self.slots.get(&destination) {
            Some(slot) if slot.entry.is_alive(now) => {}
            _ => return Err("expired"),
        }

        for address in [from, destination] {
            if let Some(slot) = self.slots.get_mut(&address) {
                slot.entry.touch(now, ttl);
            }
        }

        Ok((socket, destination))
    }
}

impl Drop for RelayTable {
    fn drop(&mut self) {
        for slot in self.slots.values() {
            slot.receiver.abort();
        }
    }
}

struct EngineInner {
    config: RelayConfig,
    table: Mutex<RelayTable>,
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, RelayTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(
        &self,
        port: u16,
        from: SocketAddr,
    ) -> std::result::Result<(Arc<UdpSocket>, NetAddress), &'static str> {
        let mut table = self.lock();
        table.route(port, NetAddress::from(from), Instant::now(), self.config.ttl)
    }
}

/// UDP relay engine.
///
/// Cheap to clone; clones share the same pool. Must be used from within a
/// Tokio runtime since each relay spawns a receive task.
#[derive(Clone)]
pub struct RelayEngine {
    inner: Arc<EngineInner>,
}

impl RelayEngine {
    /// Create an engine with no relays
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let pool = PortPool::new(config.bind_ip, config.ports);

        Self {
            inner: Arc::new(EngineInner {
                config,
                table: Mutex::new(RelayTable {
                    slots: HashMap::new(),
                    ports: HashMap::new(),
                    pool,
                }),
            }),
        }
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Ensure a relay entry exists for `address`.
    ///
    /// A live entry is returned unchanged, without extending its expiry. An
    /// expired entry that has not been swept yet is reclaimed and replaced.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::PoolExhausted`] if no port is available, or
    /// [`RelayError::Io`] if the socket cannot be registered with the runtime.
    pub fn create_relay(&self, address: NetAddress) -> Result<RelayEntry> {
        let now = Instant::now();
        let mut table = self.inner.lock();

        if let Some(slot) = table.slots.get(&address) {
            if slot.entry.is_alive(now) {
                tracing::trace!(%address, port = slot.entry.port, "Reusing live relay");
                return Ok(slot.entry.clone());
            }
        }

        if let Some(stale) = table.remove(&address) {
            tracing::debug!(%address, port = stale.port, "Reclaimed expired relay before sweep");
        }

        let (port, std_socket) = table.pool.allocate()?;
        let socket = match UdpSocket::from_std(std_socket) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                table.pool.release(port);
                return Err(e.into());
            }
        };

        let receiver = tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            port,
            Arc::clone(&socket),
            self.inner.config.max_datagram_size,
        ));

        let entry = RelayEntry::new(address, port, now, self.inner.config.ttl);
        table.ports.insert(port, address);
        table.slots.insert(
            address,
            RelaySlot {
                entry: entry.clone(),
                socket,
                receiver,
                peers: Vec::new(),
            },
        );
        metrics::set_active_relays(table.slots.len());

        tracing::info!(%address, port, "Created relay");
        Ok(entry)
    }

    /// Associate two entries for bidirectional forwarding.
    ///
    /// Pairing is idempotent; re-pairing an existing association makes it
    /// the most recent one for both sides.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownRelay`] if either entry no longer exists,
    /// or [`RelayError::InvalidAddress`] when both entries are the same.
    pub fn pair(&self, a: &RelayEntry, b: &RelayEntry) -> Result<()> {
        if a.address == b.address {
            return Err(RelayError::InvalidAddress(format!(
                "cannot pair relay {} with itself",
                a.address
            )));
        }

        let mut table = self.inner.lock();
        for address in [&a.address, &b.address] {
            if !table.slots.contains_key(address) {
                return Err(RelayError::UnknownRelay(*address));
            }
        }

        for (this, other) in [(a.address, b.address), (b.address, a.address)] {
            if let Some(slot) = table.slots.get_mut(&this) {
                slot.peers.retain(|p| *p != other);
                slot.peers.push(other);
            }
        }

        tracing::debug!(a = %a.address, b = %b.address, "Paired relays");
        Ok(())
    }

    /// Remove every entry whose expiry is at or before `now`.
    ///
    /// Returns the addresses that were removed.
    pub fn sweep(&self, now: Instant) -> Vec<NetAddress> {
        let mut table = self.inner.lock();

        let expired: Vec<NetAddress> = table
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(address, _)| *address)
            .collect();

        for address in &expired {
            if let Some(entry) = table.remove(address) {
                tracing::info!(%address, port = entry.port, "Relay expired");
            }
        }

        if !expired.is_empty() {
            metrics::set_active_relays(table.slots.len());
        }

        expired
    }

    /// Spawn the periodic sweep task.
    ///
    /// The task stops by itself once every handle to the engine is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let engine = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(inner) = engine.upgrade() else {
                    break;
                };
                let removed = RelayEngine { inner }.sweep(Instant::now());
                if !removed.is_empty() {
                    tracing::debug!(count = removed.len(), "Swept expired relays");
                }
            }
        })
    }

    /// Snapshot of the entry for `address`, if any
    #[must_use]
    pub fn get(&self, address: &NetAddress) -> Option<RelayEntry> {
        self.inner
            .lock()
            .slots
            .get(address)
            .map(|slot| slot.entry.clone())
    }

    /// Addresses currently paired with `address`, most recent last
    #[must_use]
    pub fn counterparts(&self, address: &NetAddress) -> Vec<NetAddress> {
        self.inner
            .lock()
            .slots
            .get(address)
            .map(|slot| slot.peers.clone())
            .unwrap_or_default()
    }

    /// Number of relay entries, expired-but-unswept included
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Check if there are no relay entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of relays that can still be created
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.inner.lock().pool.available()
    }
}

async fn receive_loop(
    engine: Weak<EngineInner>,
    port: u16,
    socket: Arc<UdpSocket>,
    buf_size: usize,
) {
    let mut buf = vec![0u8; buf_size];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            // ICMP unreachable from an earlier send surfaces here on some platforms
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                continue;
            }
            Err(e) => {
                tracing::error!(port, error = %e, "Relay socket receive failed, closing receiver");
                break;
            }
        };

        let Some(inner) = engine.upgrade() else {
            break;
        };
        let route = inner.route(port, from);
        drop(inner);

        match route {
            Ok((out, to)) => {
                tracing::trace!(port, %from, %to, len, "Forwarding datagram");
                match out.send_to(&buf[..len], to.to_socket_addr()).await {
                    Ok(_) => metrics::record_relayed(len),
                    Err(e) => tracing::warn!(port, %to, error = %e, "Relay send failed"),
                }
            }
            Err(reason) => {
                tracing::warn!(port, %from, reason, "Dropping datagram");
                metrics::record_dropped(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    fn test_config(max_slots: usize) -> RelayConfig {
        RelayConfig {
            bind_ip: LOCALHOST,
            ports: RelayPorts::Auto { max_slots },
            ..RelayConfig::default()
        }
    }

    fn address(s: &str) -> NetAddress {
        s.parse().unwrap()
    }

    async fn peer_socket() -> (UdpSocket, NetAddress) {
        let socket = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let addr = NetAddress::from(socket.local_addr().unwrap());
        (socket, addr)
    }

    fn relay_addr(entry: &RelayEntry) -> SocketAddr {
        SocketAddr::new(LOCALHOST, entry.port)
    }

    #[tokio::test]
    async fn test_create_relay_is_idempotent() {
        let engine = RelayEngine::new(test_config(8));
        let addr = address("10.0.0.1:5000");

        let first = engine.create_relay(addr).unwrap();
        let second = engine.create_relay(addr).unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_relay_allocates_once() {
        let engine = RelayEngine::new(test_config(8));
        let addr = address("10.0.0.1:5000");
        let before = engine.available_slots();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.create_relay(addr).unwrap().port })
            })
            .collect();

        let mut ports = std::collections::HashSet::new();
        for task in tasks {
            ports.insert(task.await.unwrap());
        }

        assert_eq!(ports.len(), 1);
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.available_slots(), before - 1);
    }

    #[tokio::test]
    async fn test_distinct_addresses_get_distinct_ports() {
        let engine = RelayEngine::new(test_config(8));

        let a = engine.create_relay(address("10.0.0.1:5000")).unwrap();
        let b = engine.create_relay(address("10.0.0.2:6000")).unwrap();

        assert_ne!(a.port, b.port);
        assert_eq!(engine.available_slots(), 6);
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let engine = RelayEngine::new(test_config(1));

        engine.create_relay(address("10.0.0.1:5000")).unwrap();
        let err = engine.create_relay(address("10.0.0.2:6000")).unwrap_err();
        assert!(matches!(err, RelayError::PoolExhausted));

        // Existing entry is still served
        assert!(engine.create_relay(address("10.0.0.1:5000")).is_ok());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_frees_slot() {
        let engine = RelayEngine::new(test_config(1));
        let addr = address("10.0.0.1:5000");
        let entry = engine.create_relay(addr).unwrap();

        assert!(engine.sweep(entry.expires_at - Duration::from_millis(1)).is_empty());
        assert_eq!(engine.sweep(entry.expires_at), vec![addr]);
        assert!(engine.get(&addr).is_none());
        assert_eq!(engine.available_slots(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = engine.create_relay(addr).unwrap();
        assert!(fresh.expires_at > entry.expires_at);
    }

    #[tokio::test]
    async fn test_expired_entry_is_replaced_before_sweep() {
        let config = RelayConfig {
            ttl: Duration::from_millis(20),
            ..test_config(4)
        };
        let engine = RelayEngine::new(config);
        let addr = address("10.0.0.1:5000");

        let first = engine.create_relay(addr).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = engine.create_relay(addr).unwrap();

        assert!(second.expires_at > first.expires_at);
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn test_pair_requires_existing_entries() {
        let engine = RelayEngine::new(test_config(4));
        let a = engine.create_relay(address("10.0.0.1:5000")).unwrap();
        let ghost = RelayEntry::new(
            address("10.0.0.9:9000"),
            1,
            Instant::now(),
            Duration::from_secs(1),
        );

        assert!(matches!(
            engine.pair(&a, &ghost),
            Err(RelayError::UnknownRelay(_))
        ));
        assert!(matches!(
            engine.pair(&a, &a),
            Err(RelayError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_paired_relay_forwards_both_ways() {
        let engine = RelayEngine::new(test_config(4));
        let (sock_a, addr_a) = peer_socket().await;
        let (sock_b, addr_b) = peer_socket().await;

        let relay_a = engine.create_relay(addr_a).unwrap();
        let relay_b = engine.create_relay(addr_b).unwrap();
        engine.pair(&relay_a, &relay_b).unwrap();

        // A talks to B through B's relay port and sees B's traffic coming from it
        sock_a.send_to(b"ping", relay_addr(&relay_b)).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(RECV_TIMEOUT, sock_b.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, relay_addr(&relay_a));

        sock_b.send_to(b"pong", relay_addr(&relay_a)).await.unwrap();
        let (len, from) = tokio::time::timeout(RECV_TIMEOUT, sock_a.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(from, relay_addr(&relay_b));
    }

    #[tokio::test]
    async fn test_own_port_forwards_to_counterpart() {
        let engine = RelayEngine::new(test_config(4));
        let (sock_a, addr_a) = peer_socket().await;
        let (sock_b, addr_b) = peer_socket().await;

        let relay_a = engine.create_relay(addr_a).unwrap();
        let relay_b = engine.create_relay(addr_b).unwrap();
        engine.pair(&relay_a, &relay_b).unwrap();

        sock_a.send_to(b"hello", relay_addr(&relay_a)).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(RECV_TIMEOUT, sock_b.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"hello");
    }

    #[tokio::test]
    async fn test_unexpected_source_is_dropped() {
        let engine = RelayEngine::new(test_config(4));
        let (_sock_a, addr_a) = peer_socket().await;
        let (sock_b, addr_b) = peer_socket().await;
        let (stranger, _) = peer_socket().await;

        let relay_a = engine.create_relay(addr_a).unwrap();
        let relay_b = engine.create_relay(addr_b).unwrap();
        engine.pair(&relay_a, &relay_b).unwrap();
        let before = engine.get(&addr_a).unwrap().expires_at;

        stranger
            .send_to(b"spoof", relay_addr(&relay_a))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let received =
            tokio::time::timeout(Duration::from_millis(200), sock_b.recv_from(&mut buf)).await;
        assert!(received.is_err(), "spoofed datagram must not be forwarded");
        assert_eq!(engine.get(&addr_a).unwrap().expires_at, before);
    }

    #[tokio::test]
    async fn test_unpaired_relay_does_not_forward() {
        let engine = RelayEngine::new(test_config(4));
        let (sock_a, addr_a) = peer_socket().await;
        let (sock_b, addr_b) = peer_socket().await;

        let _relay_a = engine.create_relay(addr_a).unwrap();
        let relay_b = engine.create_relay(addr_b).unwrap();

        sock_a.send_to(b"early", relay_addr(&relay_b)).await.unwrap();

        let mut buf = [0u8; 64];
        let received =
            tokio::time::timeout(Duration::from_millis(200), sock_b.recv_from(&mut buf)).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn test_traffic_refreshes_both_entries() {
        let engine = RelayEngine::new(test_config(4));
        let (sock_a, addr_a) = peer_socket().await;
        let (sock_b, addr_b) = peer_socket().await;

        let relay_a = engine.create_relay(addr_a).unwrap();
        let relay_b = engine.create_relay(addr_b).unwrap();
        engine.pair(&relay_a, &relay_b).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        sock_a.send_to(b"keepalive", relay_addr(&relay_b)).await.unwrap();
        let mut buf = [0u8; 64];
        tokio::time::timeout(RECV_TIMEOUT, sock_b.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert!(engine.get(&addr_a).unwrap().expires_at > relay_a.expires_at);
        assert!(engine.get(&addr_b).unwrap().expires_at > relay_b.expires_at);
    }

    #[tokio::test]
    async fn test_sweep_tears_down_pairing() {
        let engine = RelayEngine::new(test_config(4));
        let addr_a = address("10.0.0.1:5000");
        let addr_b = address("10.0.0.2:6000");

        let relay_a = engine.create_relay(addr_a).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let relay_b = engine.create_relay(addr_b).unwrap();
        engine.pair(&relay_a, &relay_b).unwrap();
        assert_eq!(engine.counterparts(&addr_b), vec![addr_a]);

        // Only A has expired at this instant
        assert_eq!(engine.sweep(relay_a.expires_at), vec![addr_a]);
        assert!(engine.counterparts(&addr_b).is_empty());
        assert!(engine.get(&addr_b).is_some());
    }

    #[tokio::test]
    async fn test_repairing_moves_counterpart_to_most_recent() {
        let engine = RelayEngine::new(test_config(4));
        let host = engine.create_relay(address("10.0.0.1:5000")).unwrap();
        let first = engine.create_relay(address("10.0.0.2:6000")).unwrap();
        let second = engine.create_relay(address("10.0.0.3:7000")).unwrap();

        engine.pair(&host, &first).unwrap();
        engine.pair(&host, &second).unwrap();
        engine.pair(&host, &first).unwrap();

        assert_eq!(
            engine.counterparts(&host.address),
            vec![second.address, first.address]
        );
    }

    #[tokio::test]
    async fn test_sweeper_task_removes_idle_relays() {
        let config = RelayConfig {
            ttl: Duration::from_millis(30),
            sweep_interval: Duration::from_millis(20),
            ..test_config(4)
        };
        let engine = RelayEngine::new(config);
        let sweeper = engine.spawn_sweeper();

        engine.create_relay(address("10.0.0.1:5000")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(engine.is_empty());
        sweeper.abort();
    }
}
