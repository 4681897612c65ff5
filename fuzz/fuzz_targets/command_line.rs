//! Fuzz target for control line parsing
//!
//! The parser must never panic, and anything it accepts must encode to a
//! line that parses back to the same command.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rendezvous_broker::Command;
use rendezvous_broker::protocol::MAX_LINE_LENGTH;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(command) = Command::parse(line) {
        let encoded = command.encode();
        if encoded.len() > MAX_LINE_LENGTH {
            return;
        }
        let reparsed = Command::parse(&encoded).expect("encoded command parses");
        assert_eq!(reparsed, command);
    }
});
