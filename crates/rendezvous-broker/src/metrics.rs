//! Broker metrics.

use metrics::{counter, gauge};

pub(crate) fn set_active_hosts(count: usize) {
    gauge!("rendezvous_active_hosts").set(count as f64);
}

pub(crate) fn record_command(command: &'static str, outcome: &'static str) {
    counter!("rendezvous_commands_total", "command" => command, "outcome" => outcome).increment(1);
}

pub(crate) fn record_registration(outcome: &'static str) {
    counter!("rendezvous_registrations_total", "outcome" => outcome).increment(1);
}
