// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use sip_core::{CSeq, SipMessage};

use crate::ParseError;

const SINGLETONS: &[&str] = &["Call-ID", "CSeq", "From", "To"];

/// Checks the headers every transaction-layer decision depends on.
///
/// Call-ID, CSeq, From and To must each appear exactly once and a Via must
/// be present with a parsable top element. For requests the CSeq method has
/// to match the request-line method.
pub fn validate_message(msg: &SipMessage) -> Result<(), ParseError> {
    let headers = msg.headers();
    for &name in SINGLETONS {
        match headers.count(name) {
            0 => return Err(ParseError::MissingHeader(name)),
            1 => {}
            _ => return Err(ParseError::DuplicateHeader(name)),
        }
    }

    let via = headers.get("Via").ok_or(ParseError::MissingHeader("Via"))?;
    if msg.top_via().is_none() {
        return Err(ParseError::InvalidVia(via.to_string()));
    }

    let raw_cseq = headers.get("CSeq").map_or("", |v| v.as_str());
    let cseq = CSeq::parse(raw_cseq)
        .ok_or_else(|| ParseError::InvalidHeader(format!("CSeq: {raw_cseq}")))?;
    if let SipMessage::Request(req) = msg {
        if &cseq.method != req.method() {
            return Err(ParseError::CSeqMismatch {
                method: req.method().clone(),
                cseq: cseq.method,
            });
        }
    }
    Ok(())
}
