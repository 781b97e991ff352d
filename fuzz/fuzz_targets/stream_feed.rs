// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![no_main]
use libfuzzer_sys::fuzz_target;
use sip_parse::MessageParser;

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    // First byte picks the fragment size, so one input exercises many
    // reassembly boundaries.
    let chunk = usize::from(split).max(1);
    let mut parser = MessageParser::stream().with_max_size(8 * 1024);
    for fragment in rest.chunks(chunk) {
        if parser.feed(fragment).is_err() {
            parser.reset();
        }
    }
});
