//! Fuzz target for address parsing
//!
//! Observed endpoints come from the network layer and must never panic the
//! parser.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rendezvous_relay::NetAddress;

#[derive(Arbitrary, Debug)]
struct Endpoint<'a> {
    ip: &'a str,
    port: &'a str,
}

fuzz_target!(|endpoint: Endpoint<'_>| {
    if let Ok(address) = NetAddress::from_observed_endpoint(endpoint.ip, endpoint.port) {
        let reparsed: NetAddress = address.to_string().parse().expect("display parses");
        assert_eq!(reparsed, address);
    }

    let _ = endpoint.ip.parse::<NetAddress>();
});
