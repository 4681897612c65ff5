//! Command dispatch.
//!
//! A [`Dispatcher`] maps command names to plain handler functions. Each
//! incoming command is wrapped in an [`Exchange`] that knows the issuing
//! socket and how to reach other sockets through an [`Outbox`]. Handler
//! errors never escape: the dispatcher logs them and answers the issuing
//! peer with a failure reply.

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::host::SocketId;
use crate::metrics;
use crate::protocol::{Command, CommandKind};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Delivery of outgoing commands to control connections
pub trait Outbox: Send + Sync {
    /// Queue `command` for the connection `target`. Returns false if the
    /// connection is gone.
    fn deliver(&self, target: SocketId, command: Command) -> bool;
}

/// Context of one incoming command
pub struct Exchange<'a> {
    source: SocketId,
    remote: SocketAddr,
    command: &'a Command,
    outbox: &'a dyn Outbox,
}

impl<'a> Exchange<'a> {
    /// Wrap `command` received on connection `source`
    #[must_use]
    pub fn new(
        source: SocketId,
        remote: SocketAddr,
        command: &'a Command,
        outbox: &'a dyn Outbox,
    ) -> Self {
        Self {
            source,
            remote,
            command,
            outbox,
        }
    }

    /// Issuing connection
    #[must_use]
    pub fn source(&self) -> SocketId {
        self.source
    }

    /// Transport address of the issuing connection
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Command being handled
    #[must_use]
    pub fn command(&self) -> &'a Command {
        self.command
    }

    /// Answer the issuing peer, correlated with its request if it sent one
    pub fn reply(&self, name: &str, params: Vec<String>) -> bool {
        self.outbox.deliver(
            self.source,
            Command::reply(name, self.command.exchange_id.clone(), params),
        )
    }

    /// Push an uncorrelated command to another connection
    pub fn send(&self, target: SocketId, name: &str, params: Vec<String>) -> bool {
        self.outbox.deliver(target, Command::event(name, params))
    }

    /// Report failure of the command to the issuing peer
    pub fn fail(&self, message: &str) -> bool {
        self.outbox.deliver(
            self.source,
            Command::failure(
                self.command.name.clone(),
                self.command.exchange_id.clone(),
                message,
            ),
        )
    }
}

/// Command handler
pub type Handler = fn(&Command, &Exchange<'_>, &Broker) -> Result<()>;

/// Name-to-handler table
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<&'static str, Handler>,
}

impl Dispatcher {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `name`, replacing any previous one
    #[must_use]
    pub fn with(mut self, name: &'static str, handler: Handler) -> Self {
        self.handlers.insert(name, handler);
        self
    }

    /// Registered command names
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// Run the handler for the exchange's command.
    ///
    /// Unknown commands and handler errors are answered with a failure
    /// reply to the issuing peer. Replies and failures sent by a peer are
    /// answers, not commands, and are dropped without running a handler.
    pub fn dispatch(&self, exchange: &Exchange<'_>, broker: &Broker) {
        let command = exchange.command();
        let registered = self.handlers.get_key_value(command.name.as_str());

        if matches!(command.kind, CommandKind::Reply | CommandKind::Failure) {
            tracing::debug!(
                command = %command.name,
                kind = ?command.kind,
                socket = %exchange.source(),
                "Ignoring answer from peer"
            );
            let label = registered.map_or("unknown", |(&name, _)| name);
            metrics::record_command(label, "ignored");
            return;
        }

        let (label, outcome) = match registered {
            Some((&name, handler)) => (name, handler(command, exchange, broker)),
            None => (
                "unknown",
                Err(BrokerError::UnknownCommand(command.name.clone())),
            ),
        };

        match outcome {
            Ok(()) => metrics::record_command(label, "ok"),
            Err(e) => {
                if e.is_invariant_violation() {
                    tracing::error!(
                        command = %command.name,
                        socket = %exchange.source(),
                        error = %e,
                        "Broker invariant violated"
                    );
                } else {
                    tracing::debug!(
                        command = %command.name,
                        socket = %exchange.source(),
                        error = %e,
                        "Command failed"
                    );
                }
                exchange.fail(&e.to_string());
                metrics::record_command(label, e.kind());
            }
        }
    }
}
