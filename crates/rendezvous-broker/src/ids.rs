//! Host identifier generation.
//!
//! Both the public `oid` and the secret `pid` are random tokens over a
//! URL-safe 64-symbol alphabet drawn from the operating system RNG. With the
//! default lengths an oid carries 126 bits and a pid 768 bits of entropy.

use rand::Rng;
use rand::rngs::OsRng;

/// Symbols identifiers are drawn from
pub const ID_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Identifier lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdConfig {
    /// Length of public object ids
    pub oid_length: usize,
    /// Length of private ids
    pub pid_length: usize,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            oid_length: 21,
            pid_length: 128,
        }
    }
}

/// Random token source for host identifiers
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    config: IdConfig,
}

impl IdGenerator {
    /// Create a generator with the given lengths
    #[must_use]
    pub fn new(config: IdConfig) -> Self {
        Self { config }
    }

    /// Generate a public object id
    #[must_use]
    pub fn oid(&self) -> String {
        token(self.config.oid_length)
    }

    /// Generate a private id
    #[must_use]
    pub fn pid(&self) -> String {
        token(self.config.pid_length)
    }

    /// Configured lengths
    #[must_use]
    pub fn config(&self) -> IdConfig {
        self.config
    }
}

fn token(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
        .collect()
}
