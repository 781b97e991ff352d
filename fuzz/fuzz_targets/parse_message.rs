// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![no_main]
use libfuzzer_sys::fuzz_target;
use sip_parse::{parse_message, validate_message};

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    // Either outcome is fine; panics are not.
    if let Ok(message) = parse_message(data) {
        let _ = validate_message(&message);
    }
});
