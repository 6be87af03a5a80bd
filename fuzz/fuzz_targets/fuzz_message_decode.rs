//! Fuzz target for payload decoding.
//!
//! The first two bytes pick a message type code, the rest is the payload.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stripe_coordinator::protocol::GroupMessage;
use stripe_coordinator::wire::{MessageHeader, MessageType, HEADER_LENGTH};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let code = u16::from_be_bytes([data[0], data[1]]);
    let Some(message_type) = MessageType::from_code(code) else {
        return;
    };
    let payload = &data[2..];
    let header = MessageHeader {
        message_type,
        flags: 0,
        total_length: (HEADER_LENGTH + payload.len()) as u32,
        sequence: 0,
    };
    // Either a message of the declared type or an error
    if let Ok(message) = GroupMessage::decode(&header, payload) {
        assert_eq!(message.message_type(), message_type);
    }
});
