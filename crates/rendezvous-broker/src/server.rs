//! Control server.
//!
//! Accepts TCP control connections, feeds their lines to the [`Broker`],
//! runs the UDP registrar and the relay sweeper.
//!
//! Every connection gets a [`SocketId`], a reader task that parses lines and
//! dispatches them, and a writer fed by an unbounded channel. Handlers reach
//! other peers by queueing on that channel through [`Connections`], so a
//! slow peer never blocks the handler that addressed it.

use crate::broker::Broker;
use crate::commands;
use crate::dispatch::{Exchange, Outbox};
use crate::error::ServerError;
use crate::host::SocketId;
use crate::ids::{IdConfig, IdGenerator};
use crate::protocol::{CodecError, Command, MAX_LINE_LENGTH};
use crate::registrar;
use dashmap::DashMap;
use rendezvous_relay::{RelayConfig, RelayEngine};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Control server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP control listener address
    pub control_addr: SocketAddr,
    /// UDP registrar address
    pub registrar_addr: SocketAddr,
    /// Relay engine settings
    pub relay: RelayConfig,
    /// Identifier lengths
    pub ids: IdConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            control_addr: SocketAddr::new(any, 8890),
            registrar_addr: SocketAddr::new(any, 8809),
            relay: RelayConfig::default(),
            ids: IdConfig::default(),
        }
    }
}

/// Live control connections, addressable by [`SocketId`]
#[derive(Default)]
pub struct Connections {
    senders: DashMap<SocketId, mpsc::UnboundedSender<Command>>,
    next_id: AtomicU64,
}

impl Connections {
    fn open(&self) -> (SocketId, mpsc::UnboundedReceiver<Command>) {
        let socket = SocketId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(socket, tx);
        (socket, rx)
    }

    fn close(&self, socket: SocketId) {
        self.senders.remove(&socket);
    }

    fn close_all(&self) {
        self.senders.clear();
    }

    /// Number of open connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Whether no connection is open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl Outbox for Connections {
    fn deliver(&self, target: SocketId, command: Command) -> bool {
        self.senders
            .get(&target)
            .is_some_and(|tx| tx.send(command).is_ok())
    }
}

/// Bound rendezvous server
pub struct Server {
    listener: TcpListener,
    registrar: UdpSocket,
    control_addr: SocketAddr,
    registrar_addr: SocketAddr,
    broker: Arc<Broker>,
    connections: Arc<Connections>,
}

impl Server {
    /// Bind the control listener and registrar socket.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if either socket cannot be bound.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.control_addr)
            .await
            .map_err(|source| ServerError::Bind {
                what: "control listener",
                addr: config.control_addr,
                source,
            })?;
        let registrar = UdpSocket::bind(config.registrar_addr)
            .await
            .map_err(|source| ServerError::Bind {
                what: "registrar",
                addr: config.registrar_addr,
                source,
            })?;

        let control_addr = listener.local_addr()?;
        let registrar_addr = registrar.local_addr()?;

        let broker = Broker::new(
            RelayEngine::new(config.relay.clone()),
            IdGenerator::new(config.ids),
            commands::dispatcher(),
        );

        tracing::info!(
            control = %control_addr,
            registrar = %registrar_addr,
            relay_ports = %config.relay.ports,
            "Rendezvous server bound"
        );

        Ok(Self {
            listener,
            registrar,
            control_addr,
            registrar_addr,
            broker: Arc::new(broker),
            connections: Arc::new(Connections::default()),
        })
    }

    /// Local control listener address
    #[must_use]
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Local registrar address
    #[must_use]
    pub fn registrar_addr(&self) -> SocketAddr {
        self.registrar_addr
    }

    /// Shared broker state
    #[must_use]
    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    /// Open control connections
    #[must_use]
    pub fn connections(&self) -> Arc<Connections> {
        Arc::clone(&self.connections)
    }

    /// Serve until the process is stopped
    ///
    /// # Errors
    ///
    /// See [`Server::run_until`].
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then close every connection.
    ///
    /// # Errors
    ///
    /// Accept failures are logged and retried, so this currently only
    /// returns `Ok`.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            registrar: registrar_socket,
            broker,
            connections,
            ..
        } = self;

        let sweeper = broker.relays().spawn_sweeper();
        let registrar = tokio::spawn(registrar::run(
            Arc::new(registrar_socket),
            Arc::clone(&broker),
        ));
        let mut sessions = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Shutting down rendezvous server");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        sessions.spawn(serve_connection(
                            stream,
                            remote,
                            Arc::clone(&broker),
                            Arc::clone(&connections),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept control connection");
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        sessions.shutdown().await;
        connections.close_all();
        registrar.abort();
        sweeper.abort();
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    broker: Arc<Broker>,
    connections: Arc<Connections>,
) {
    let (socket, mut outgoing) = connections.open();
    tracing::debug!(%socket, %remote, "Control connection opened");

    let (reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(command) = outgoing.recv().await {
            if let Err(e) = writer.write_all(command.encode().as_bytes()).await {
                tracing::debug!(%socket, error = %e, "Control write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match read_line_limited(&mut reader, &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%socket, error = %e, "Control read failed");
                break;
            }
        }

        let parsed = std::str::from_utf8(&line)
            .map_err(|_| CodecError::InvalidUtf8)
            .and_then(Command::parse);
        match parsed {
            Ok(command) => {
                let exchange = Exchange::new(socket, remote, &command, connections.as_ref());
                broker.handle(&exchange);
            }
            Err(CodecError::Empty) => {}
            Err(e) => {
                tracing::debug!(%socket, error = %e, "Malformed control line");
                connections.deliver(socket, Command::failure("error", None, &e.to_string()));
            }
        }
    }

    connections.close(socket);
    broker.disconnected(socket);
    // drains queued replies before the write half closes
    let _ = writer_task.await;
    tracing::debug!(%socket, %remote, "Control connection closed");
}

/// Read one line of at most [`MAX_LINE_LENGTH`] bytes plus terminator
async fn read_line_limited<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE_LENGTH as u64 + 1;
    let read = reader.take(limit).read_until(b'\n', line).await?;

    if read as u64 == limit && line.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            CodecError::LineTooLong,
        ));
    }
    Ok(read)
}
