// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![no_main]
use libfuzzer_sys::fuzz_target;
use sip_core::SipMessage;
use sip_parse::{parse_message, serialize_message};

fuzz_target!(|data: &[u8]| {
    if data.len() < 16 || data.len() > 2048 {
        return;
    }
    let Ok(message) = parse_message(data) else {
        return;
    };
    let serialized = serialize_message(&message);
    let reparsed = parse_message(&serialized).expect("serialized message parses");

    match (&message, &reparsed) {
        (SipMessage::Request(a), SipMessage::Request(b)) => {
            assert_eq!(a.method(), b.method());
            assert_eq!(a.uri().to_string(), b.uri().to_string());
        }
        (SipMessage::Response(a), SipMessage::Response(b)) => assert_eq!(a.code(), b.code()),
        _ => panic!("message kind changed across serialization"),
    }
    assert_eq!(message.body().len(), reparsed.body().len());
    assert_eq!(message.headers().get("Call-ID"), reparsed.headers().get("Call-ID"));
});
