//! Fuzz target for relay port range parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use rendezvous_relay::RelayPorts;

fuzz_target!(|data: &str| {
    if let Ok(ports) = data.parse::<RelayPorts>() {
        if let RelayPorts::Range { start, end } = ports {
            assert!(start > 0 && start <= end);
        }
        assert!(ports.capacity() > 0);
    }
});
