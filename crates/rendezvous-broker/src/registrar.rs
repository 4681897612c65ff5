//! UDP address registrar.
//!
//! After `register-host`, a peer sends its pid as a single datagram from the
//! UDP socket it will use for game traffic. The source address of that
//! datagram, as seen through the peer's NAT, becomes the host's `rinfo`. The
//! registrar answers `OK` or `ERR <reason>` to the same address.

use crate::broker::Broker;
use crate::metrics;
use rendezvous_relay::NetAddress;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Reply sent for a successful registration
pub const REPLY_OK: &str = "OK";

const RECV_BUFFER: usize = 2048;

/// Handle one registration datagram and return the reply payload
pub fn handle_datagram(broker: &Broker, payload: &[u8], from: SocketAddr) -> String {
    let Ok(text) = std::str::from_utf8(payload) else {
        metrics::record_registration("invalid");
        return "ERR Invalid payload".to_string();
    };

    let pid = text.trim();
    if pid.is_empty() {
        metrics::record_registration("invalid");
        return "ERR Empty pid".to_string();
    }

    let address = NetAddress::from(from);
    match broker.register_remote(pid, address) {
        Ok(host) => {
            tracing::info!(oid = %host.oid, %address, "Registered remote address");
            metrics::record_registration("ok");
            REPLY_OK.to_string()
        }
        Err(e) => {
            tracing::debug!(%address, error = %e, "Rejected address registration");
            metrics::record_registration(e.kind());
            format!("ERR {e}")
        }
    }
}

/// Serve registrations until the task is aborted
pub(crate) async fn run(socket: Arc<UdpSocket>, broker: Arc<Broker>) {
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Registrar receive failed");
                continue;
            }
        };

        let reply = handle_datagram(&broker, &buf[..len], from);
        if let Err(e) = socket.send_to(reply.as_bytes(), from).await {
            tracing::debug!(%from, error = %e, "Failed to answer registration");
        }
    }
}
