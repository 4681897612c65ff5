//! Local UDP port allocation for relay sockets.

use crate::error::{RelayError, Result};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::str::FromStr;

/// Where relay ports come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPorts {
    /// Fixed inclusive port range, e.g. for firewall rules
    Range {
        /// First port
        start: u16,
        /// Last port (inclusive)
        end: u16,
    },
    /// Let the operating system choose, capped at `max_slots` live relays
    Auto {
        /// Maximum number of concurrently bound relay ports
        max_slots: usize,
    },
}

impl RelayPorts {
    /// Total number of relays this source can hold at once
    #[must_use]
    pub fn capacity(&self) -> usize {
        match *self {
            Self::Range { start, end } if start <= end => usize::from(end - start) + 1,
            Self::Range { .. } => 0,
            Self::Auto { max_slots } => max_slots,
        }
    }
}

impl Default for RelayPorts {
    fn default() -> Self {
        Self::Range {
            start: 49152,
            end: 51200,
        }
    }
}

impl fmt::Display for RelayPorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range { start, end } => write!(f, "{start}-{end}"),
            Self::Auto { .. } => write!(f, "auto"),
        }
    }
}

impl FromStr for RelayPorts {
    type Err = RelayError;

    /// Parse `"start-end"`, a single port `"port"`, or `"auto"`.
    ///
    /// `auto` carries a default of 2048 slots; callers override `max_slots`
    /// from their own configuration.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto { max_slots: 2048 });
        }

        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| RelayError::InvalidAddress(format!("invalid relay port '{p}'")))
        };

        let (start, end) = match s.split_once('-') {
            Some((start, end)) => (parse(start)?, parse(end)?),
            None => {
                let port = parse(s)?;
                (port, port)
            }
        };

        if start == 0 || start > end {
            return Err(RelayError::InvalidAddress(format!(
                "invalid relay port range '{s}'"
            )));
        }

        Ok(Self::Range { start, end })
    }
}

enum Mode {
    Range { free: VecDeque<u16> },
    Auto { max_slots: usize },
}

/// Pool of local UDP ports.
///
/// Ports are handed out together with a freshly bound, non-blocking socket so
/// an allocated port is always actually owned by the caller. In range mode a
/// port the operating system refuses to bind (taken by another process, or
/// still held by a socket that is shutting down) is moved to the back of the
/// free list and the next one is tried.
pub(crate) struct PortPool {
    bind_ip: IpAddr,
    mode: Mode,
    in_use: HashSet<u16>,
}

impl PortPool {
    pub(crate) fn new(bind_ip: IpAddr, ports: RelayPorts) -> Self {
        let mode = match ports {
            RelayPorts::Range { start, end } => Mode::Range {
                free: (start..=end).collect(),
            },
            RelayPorts::Auto { max_slots } => Mode::Auto { max_slots },
        };

        Self {
            bind_ip,
            mode,
            in_use: HashSet::new(),
        }
    }

    /// Bind a socket on an unused port
    pub(crate) fn allocate(&mut self) -> Result<(u16, UdpSocket)> {
        match &mut self.mode {
            Mode::Range { free } => {
                for _ in 0..free.len() {
                    let Some(port) = free.pop_front() else {
                        break;
                    };

                    match bind(self.bind_ip, port) {
                        Ok(socket) => {
                            self.in_use.insert(port);
                            return Ok((port, socket));
                        }
                        Err(e) => {
                            tracing::debug!(port, error = %e, "Relay port unavailable, skipping");
                            free.push_back(port);
                        }
                    }
                }

                Err(RelayError::PoolExhausted)
            }
            Mode::Auto { max_slots } => {
                if self.in_use.len() >= *max_slots {
                    return Err(RelayError::PoolExhausted);
                }

                let socket = bind(self.bind_ip, 0)?;
                let port = socket.local_addr()?.port();
                self.in_use.insert(port);
                Ok((port, socket))
            }
        }
    }

    /// Return a port to the pool. Unknown ports are ignored.
    pub(crate) fn release(&mut self, port: u16) {
        if !self.in_use.remove(&port) {
            return;
        }

        if let Mode::Range { free } = &mut self.mode {
            free.push_back(port);
        }
    }

    /// Number of relays that can still be allocated
    pub(crate) fn available(&self) -> usize {
        match &self.mode {
            Mode::Range { free } => free.len(),
            Mode::Auto { max_slots } => max_slots.saturating_sub(self.in_use.len()),
        }
    }
}

fn bind(ip: IpAddr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::new(ip, port))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
