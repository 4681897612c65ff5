//! Brokering command handlers.
//!
//! ```text
//!   Host                     Server                     Joiner
//!    │── register-host ───────►│                          │
//!    │◄── set-oid / set-pid ───│                          │
//!    │── pid (UDP :8809) ─────►│  rinfo learned           │
//!    │                         │◄──────── register-host ──│
//!    │                         │◄──────── pid (UDP) ──────│
//!    │                         │◄──────── connect <oid> ──│
//!    │◄── connect <joiner> ────│──── connect <host> ─────►│
//! ```
//!
//! `connect-relay` follows the same shape but hands out relay ports instead
//! of peer addresses.

use crate::broker::Broker;
use crate::dispatch::{Dispatcher, Exchange};
use crate::error::{BrokerError, Result};
use crate::metrics;
use crate::protocol::Command;

/// Register the issuing connection as a host
pub const REGISTER_HOST: &str = "register-host";
/// Direct address exchange with a host
pub const CONNECT: &str = "connect";
/// Relayed connection to a host
pub const CONNECT_RELAY: &str = "connect-relay";
/// Carries a newly assigned oid
pub const SET_OID: &str = "set-oid";
/// Carries a newly assigned pid
pub const SET_PID: &str = "set-pid";

/// Dispatcher with every brokering command registered
#[must_use]
pub fn dispatcher() -> Dispatcher {
    Dispatcher::new()
        .with(REGISTER_HOST, register_host)
        .with(CONNECT, connect)
        .with(CONNECT_RELAY, connect_relay)
}

fn require_oid(command: &Command) -> Result<&str> {
    command
        .param(0)
        .filter(|oid| !oid.is_empty())
        .ok_or(BrokerError::MissingParameter("oid"))
}

/// `register-host`: assign an oid and pid to the issuing connection.
///
/// Registering again from the same connection repeats the existing
/// identifiers. The host lives until its connection closes.
///
/// # Errors
///
/// Only fails on repository invariant violations.
pub fn register_host(_command: &Command, exchange: &Exchange<'_>, broker: &Broker) -> Result<()> {
    let socket = exchange.source();

    let host = match broker.hosts().find_by_socket(socket) {
        Some(existing) => {
            tracing::debug!(oid = %existing.oid, %socket, "Connection already registered");
            existing
        }
        None => {
            let host = broker.hosts().register(socket, broker.ids())?;
            metrics::set_active_hosts(broker.hosts().len());
            tracing::info!(
                oid = %host.oid,
                %socket,
                remote = %exchange.remote_addr(),
                "Registered host"
            );
            host
        }
    };

    exchange.reply(SET_OID, vec![host.oid]);
    exchange.reply(SET_PID, vec![host.pid]);
    Ok(())
}

/// `connect <oid>`: tell the caller the host's address and the host the
/// caller's address.
///
/// # Errors
///
/// [`BrokerError::UnknownHost`], [`BrokerError::UnknownCaller`] or
/// [`BrokerError::UnknownAddress`] when either party is not ready. Nothing
/// is sent to anyone on failure.
pub fn connect(command: &Command, exchange: &Exchange<'_>, broker: &Broker) -> Result<()> {
    let oid = require_oid(command)?;
    let host = broker
        .hosts()
        .find(oid)
        .ok_or_else(|| BrokerError::UnknownHost(oid.to_string()))?;
    let host_address = host.rinfo.ok_or(BrokerError::UnknownAddress("host"))?;

    let caller = broker
        .hosts()
        .find_by_socket(exchange.source())
        .ok_or(BrokerError::UnknownCaller)?;
    let caller_address = caller.rinfo.ok_or(BrokerError::UnknownAddress("caller"))?;

    exchange.reply(CONNECT, vec![host_address.to_string()]);
    if !exchange.send(host.socket, CONNECT, vec![caller_address.to_string()]) {
        tracing::debug!(oid = %host.oid, "Host connection closed before connect was delivered");
    }

    tracing::info!(
        host = %host.oid,
        caller = %caller.oid,
        "Brokered direct connection"
    );
    Ok(())
}

/// `connect-relay <oid>`: allocate relay ports for both parties, pair them,
/// and hand each side the port that represents the other.
///
/// The caller receives the host's relay port and the host receives the
/// caller's.
///
/// # Errors
///
/// The same lookup errors as [`connect`], plus
/// [`BrokerError::RelayPoolExhausted`] when no port is left.
pub fn connect_relay(command: &Command, exchange: &Exchange<'_>, broker: &Broker) -> Result<()> {
    let oid = require_oid(command)?;
    let host = broker
        .hosts()
        .find(oid)
        .ok_or_else(|| BrokerError::UnknownHost(oid.to_string()))?;
    let caller = broker
        .hosts()
        .find_by_socket(exchange.source())
        .ok_or(BrokerError::UnknownCaller)?;

    let host_address = host.rinfo.ok_or(BrokerError::UnknownAddress("host"))?;
    let caller_address = caller.rinfo.ok_or(BrokerError::UnknownAddress("caller"))?;

    let host_relay = broker.relays().create_relay(host_address)?;
    let caller_relay = broker.relays().create_relay(caller_address)?;
    broker.relays().pair(&host_relay, &caller_relay)?;

    broker.hosts().set_relay(&host.oid, host_relay.port);
    broker.hosts().set_relay(&caller.oid, caller_relay.port);

    exchange.reply(CONNECT_RELAY, vec![host_relay.port.to_string()]);
    if !exchange.send(
        host.socket,
        CONNECT_RELAY,
        vec![caller_relay.port.to_string()],
    ) {
        tracing::debug!(oid = %host.oid, "Host connection closed before connect-relay was delivered");
    }

    tracing::info!(
        host = %host.oid,
        caller = %caller.oid,
        host_port = host_relay.port,
        caller_port = caller_relay.port,
        "Brokered relayed connection"
    );
    Ok(())
}
