//! # Rendezvous Broker
//!
//! Connection brokering for peers behind NAT.
//!
//! Peers keep a TCP control connection to the server and register as hosts.
//! A peer then sends its private id over UDP so the server learns its
//! externally visible address. Joiners ask to connect to a host by its
//! public id and the server either exchanges the two addresses for direct
//! hole punching or allocates a pair of relay ports.
//!
//! ## Architecture
//!
//! ```text
//!  TCP :8890 ──► Server ──► Dispatcher ──► commands ──► HostRepository
//!                  │                          │
//!                  │                          └──────► RelayEngine
//!  UDP :8809 ──► registrar ──► Broker::register_remote
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use rendezvous_broker::{Server, ServerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::bind(ServerConfig::default()).await?;
//! server.run_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod commands;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod ids;
mod metrics;
pub mod protocol;
pub mod registrar;
pub mod repository;
pub mod server;

pub use broker::Broker;
pub use dispatch::{Dispatcher, Exchange, Handler, Outbox};
pub use error::{BrokerError, Result, ServerError};
pub use host::{HostEntity, HostState, SocketId};
pub use ids::{IdConfig, IdGenerator};
pub use protocol::{CodecError, Command, CommandKind};
pub use repository::HostRepository;
pub use server::{Connections, Server, ServerConfig};
