// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![no_main]
use libfuzzer_sys::fuzz_target;
use sip_core::{CSeq, SipUri, ViaHeader};

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 || data.len() > 1024 {
        return;
    }
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let _ = SipUri::parse(s);
    let _ = CSeq::parse(s);
    if let Some(via) = ViaHeader::parse(s) {
        // Whatever parsed must parse again after display.
        assert!(ViaHeader::parse(&via.to_string()).is_some());
    }
});
