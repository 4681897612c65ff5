//! End-to-end tests over real sockets.
//!
//! Each test starts a server on loopback, connects peers over TCP, registers
//! their UDP addresses with the registrar and checks the brokered outcome.

use rendezvous_broker::{CommandKind, commands};
use rendezvous_integration_tests::{TestPeer, TestServer, eventually, relay_config};
use std::net::SocketAddr;
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(200);

fn port_param(line: &rendezvous_broker::Command) -> u16 {
    line.param(0)
        .expect("port param")
        .parse()
        .expect("numeric port")
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_host_assigns_identifiers() {
    let server = TestServer::start().await;
    let host = TestPeer::registered(&server).await;

    assert_eq!(host.oid.len(), 21);
    assert_eq!(host.pid.len(), 128);
    assert!(
        host.oid
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    );
    assert!(server.broker.hosts().find(&host.oid).is_some());

    server.shutdown().await;
}

#[tokio::test]
async fn test_request_replies_carry_exchange_id() {
    let server = TestServer::start().await;
    let mut host = TestPeer::connect(&server).await;

    host.send_line("register-host?42").await;

    assert!(host.recv_line().await.starts_with("set-oid.42 "));
    assert!(host.recv_line().await.starts_with("set-pid.42 "));

    server.shutdown().await;
}

#[tokio::test]
async fn test_registrar_learns_observed_address() {
    let server = TestServer::start().await;
    let host = TestPeer::registered(&server).await;

    assert_eq!(host.register_address(&server).await, "OK");

    let stored = server.broker.hosts().find(&host.oid).unwrap();
    assert_eq!(stored.rinfo.unwrap().to_socket_addr(), host.udp_addr());

    server.shutdown().await;
}

#[tokio::test]
async fn test_registrar_rejects_unknown_pid() {
    let server = TestServer::start().await;
    let mut stranger = TestPeer::connect(&server).await;
    stranger.pid = "not-a-registered-pid".to_string();

    assert_eq!(stranger.register_address(&server).await, "ERR Unknown pid");

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_removes_host() {
    let server = TestServer::start().await;
    let host = TestPeer::ready(&server).await;
    let mut joiner = TestPeer::ready(&server).await;
    let oid = host.oid.clone();

    drop(host);
    let broker = server.broker.clone();
    assert!(eventually(|| broker.hosts().find(&oid).is_none()).await);

    joiner.send_line(&format!("connect {oid}")).await;
    let failure = joiner.recv_command().await;
    assert_eq!(failure.kind, CommandKind::Failure);
    assert_eq!(failure.param(0), Some(format!("Unknown host oid: {oid}").as_str()));

    server.shutdown().await;
}

// ============================================================================
// Direct connection
// ============================================================================

#[tokio::test]
async fn test_connect_exchanges_addresses() {
    let server = TestServer::start().await;
    let mut host = TestPeer::ready(&server).await;
    let mut joiner = TestPeer::ready(&server).await;

    joiner.send_line(&format!("connect {}", host.oid)).await;

    let to_joiner = joiner.recv_command().await;
    assert_eq!(to_joiner.name, commands::CONNECT);
    assert_eq!(to_joiner.param(0), Some(host.udp_addr().to_string().as_str()));

    let to_host = host.recv_command().await;
    assert_eq!(to_host.name, commands::CONNECT);
    assert_eq!(to_host.param(0), Some(joiner.udp_addr().to_string().as_str()));

    // The exchanged addresses are enough for the peers to talk directly
    let joiner_addr: SocketAddr = to_host.param(0).unwrap().parse().unwrap();
    host.udp.send_to(b"punch", joiner_addr).await.unwrap();
    let (payload, from) = joiner.recv_datagram().await;
    assert_eq!(payload, b"punch");
    assert_eq!(from, host.udp_addr());

    server.shutdown().await;
}

#[tokio::test]
async fn test_connect_unknown_host_fails() {
    let server = TestServer::start().await;
    let mut joiner = TestPeer::ready(&server).await;

    joiner.send_line("connect?5 nosuchoid").await;

    assert_eq!(
        joiner.recv_line().await,
        "connect!5 \"Unknown host oid: nosuchoid\""
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_connect_to_host_without_address_fails() {
    let server = TestServer::start().await;
    let mut host = TestPeer::registered(&server).await;
    let mut joiner = TestPeer::ready(&server).await;

    joiner.send_line(&format!("connect {}", host.oid)).await;

    let failure = joiner.recv_command().await;
    assert_eq!(failure.kind, CommandKind::Failure);
    assert_eq!(
        failure.param(0),
        Some("No remote address registered for host")
    );

    // The host hears nothing about a failed attempt; its next message is
    // the reply to its own request
    host.send_line("register-host?1").await;
    assert!(host.recv_line().await.starts_with("set-oid.1 "));

    server.shutdown().await;
}

#[tokio::test]
async fn test_connect_from_unregistered_socket_fails() {
    let server = TestServer::start().await;
    let host = TestPeer::ready(&server).await;
    let mut stranger = TestPeer::connect(&server).await;

    stranger.send_line(&format!("connect {}", host.oid)).await;

    let failure = stranger.recv_command().await;
    assert_eq!(
        failure.param(0),
        Some("Unknown client: socket has not registered")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_nat_rebinding_updates_exchanged_address() {
    let server = TestServer::start().await;
    let mut host = TestPeer::ready(&server).await;
    let mut joiner = TestPeer::ready(&server).await;

    // Host's mapping changes: same pid, new UDP socket
    host.udp = tokio::net::UdpSocket::bind((rendezvous_integration_tests::LOCALHOST, 0))
        .await
        .unwrap();
    assert_eq!(host.register_address(&server).await, "OK");

    joiner.send_line(&format!("connect {}", host.oid)).await;
    let to_joiner = joiner.recv_command().await;
    assert_eq!(to_joiner.param(0), Some(host.udp_addr().to_string().as_str()));

    server.shutdown().await;
}

// ============================================================================
// Relayed connection
// ============================================================================

#[tokio::test]
async fn test_connect_relay_forwards_both_ways() {
    let server = TestServer::start().await;
    let mut host = TestPeer::ready(&server).await;
    let mut joiner = TestPeer::ready(&server).await;

    joiner
        .send_line(&format!("connect-relay?1 {}", host.oid))
        .await;

    let to_joiner = joiner.recv_command().await;
    assert_eq!(to_joiner.kind, CommandKind::Reply);
    assert_eq!(to_joiner.exchange_id.as_deref(), Some("1"));
    let host_port = port_param(&to_joiner);

    let to_host = host.recv_command().await;
    assert_eq!(to_host.name, commands::CONNECT_RELAY);
    let joiner_port = port_param(&to_host);
    assert_ne!(host_port, joiner_port);

    // Joiner -> host
    joiner
        .udp
        .send_to(b"hello host", server.relay_addr(host_port))
        .await
        .unwrap();
    let (payload, from) = host.recv_datagram().await;
    assert_eq!(payload, b"hello host");
    assert_eq!(from, server.relay_addr(joiner_port));

    // Host -> joiner
    host.udp
        .send_to(b"hello joiner", server.relay_addr(joiner_port))
        .await
        .unwrap();
    let (payload, from) = joiner.recv_datagram().await;
    assert_eq!(payload, b"hello joiner");
    assert_eq!(from, server.relay_addr(host_port));

    server.shutdown().await;
}

#[tokio::test]
async fn test_relay_drops_unknown_sources() {
    let server = TestServer::start().await;
    let mut host = TestPeer::ready(&server).await;
    let mut joiner = TestPeer::ready(&server).await;
    let outsider = TestPeer::connect(&server).await;

    joiner.send_line(&format!("connect-relay {}", host.oid)).await;
    let host_port = port_param(&joiner.recv_command().await);
    host.recv_command().await;

    outsider
        .udp
        .send_to(b"spoof", server.relay_addr(host_port))
        .await
        .unwrap();
    host.expect_no_datagram(QUIET).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_host_serves_several_relayed_joiners() {
    let server = TestServer::start().await;
    let mut host = TestPeer::ready(&server).await;
    let mut first = TestPeer::ready(&server).await;
    let mut second = TestPeer::ready(&server).await;

    first.send_line(&format!("connect-relay {}", host.oid)).await;
    let host_port = port_param(&first.recv_command().await);
    let first_port = port_param(&host.recv_command().await);

    second.send_line(&format!("connect-relay {}", host.oid)).await;
    assert_eq!(port_param(&second.recv_command().await), host_port);
    let second_port = port_param(&host.recv_command().await);

    for (joiner, port) in [(&first, first_port), (&second, second_port)] {
        joiner
            .udp
            .send_to(b"ping", server.relay_addr(host_port))
            .await
            .unwrap();
        let (payload, from) = host.recv_datagram().await;
        assert_eq!(payload, b"ping");
        assert_eq!(from, server.relay_addr(port));
    }

    host.udp
        .send_to(b"to first", server.relay_addr(first_port))
        .await
        .unwrap();
    let (payload, _) = first.recv_datagram().await;
    assert_eq!(payload, b"to first");
    second.expect_no_datagram(QUIET).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_idle_relays_expire() {
    let mut relay = relay_config();
    relay.ttl = Duration::from_millis(300);
    relay.sweep_interval = Duration::from_millis(50);
    let server = TestServer::start_with(relay).await;
    let mut host = TestPeer::ready(&server).await;
    let mut joiner = TestPeer::ready(&server).await;

    joiner.send_line(&format!("connect-relay {}", host.oid)).await;
    let host_port = port_param(&joiner.recv_command().await);
    host.recv_command().await;
    assert_eq!(server.broker.relays().len(), 2);

    let broker = server.broker.clone();
    assert!(eventually(|| broker.relays().is_empty()).await);

    joiner
        .udp
        .send_to(b"late", server.relay_addr(host_port))
        .await
        .unwrap();
    host.expect_no_datagram(QUIET).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_connect_relay_without_caller_address_fails() {
    let server = TestServer::start().await;
    let host = TestPeer::ready(&server).await;
    let mut joiner = TestPeer::registered(&server).await;

    joiner.send_line(&format!("connect-relay {}", host.oid)).await;

    let failure = joiner.recv_command().await;
    assert_eq!(
        failure.param(0),
        Some("No remote address registered for caller")
    );
    assert!(server.broker.relays().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_line_keeps_connection_open() {
    let server = TestServer::start().await;
    let mut peer = TestPeer::connect(&server).await;

    peer.send_line("say \"unterminated").await;
    let failure = peer.recv_command().await;
    assert_eq!(failure.kind, CommandKind::Failure);

    peer.register().await;
    assert!(server.broker.hosts().find(&peer.oid).is_some());

    server.shutdown().await;
}
