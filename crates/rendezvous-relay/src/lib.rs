//! # Rendezvous Relay
//!
//! UDP fallback relay for peers that cannot reach each other directly.
//!
//! This crate provides:
//! - [`NetAddress`], the normalized address key of a relay
//! - [`RelayEntry`], one peer's relay leg with sliding expiry
//! - [`RelayEngine`], which allocates relay ports, pairs entries, forwards
//!   datagrams and sweeps idle entries
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────┐
//!                    │       Relay Engine       │
//!                    │  pA (for A)   pB (for B) │
//!                    └─────┬──────────────┬─────┘
//!                          │              │
//!              ┌───────────┘              └───────────┐
//!              ▼                                      ▼
//!       ┌─────────────┐                        ┌─────────────┐
//!       │   Peer A    │                        │   Peer B    │
//!       │  (NAT'd)    │                        │  (NAT'd)    │
//!       └─────────────┘                        └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use rendezvous_relay::{NetAddress, RelayConfig, RelayEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = RelayEngine::new(RelayConfig::default());
//! let _sweeper = engine.spawn_sweeper();
//!
//! let host: NetAddress = "203.0.113.7:40000".parse()?;
//! let joiner: NetAddress = "198.51.100.2:51000".parse()?;
//!
//! let host_relay = engine.create_relay(host)?;
//! let joiner_relay = engine.create_relay(joiner)?;
//! engine.pair(&host_relay, &joiner_relay)?;
//!
//! // The joiner now sends to server:host_relay.port and vice versa
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod engine;
pub mod entry;
pub mod error;
mod metrics;
pub mod pool;

pub use address::NetAddress;
pub use engine::{RelayConfig, RelayEngine};
pub use entry::RelayEntry;
pub use error::{RelayError, Result};
pub use pool::RelayPorts;
