//! Relay metrics.
//!
//! Recorded through the `metrics` facade; without an installed recorder these
//! calls are no-ops.

use metrics::{counter, gauge};

pub(crate) fn set_active_relays(count: usize) {
    gauge!("rendezvous_active_relays").set(count as f64);
}

pub(crate) fn record_relayed(bytes: usize) {
    counter!("rendezvous_relayed_datagrams_total").increment(1);
    counter!("rendezvous_relayed_bytes_total").increment(bytes as u64);
}

pub(crate) fn record_dropped(reason: &'static str) {
    counter!("rendezvous_dropped_datagrams_total", "reason" => reason).increment(1);
}
