// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Requests the transaction layer generates on its own behalf.

use bytes::Bytes;
use sip_core::{CSeq, Headers, Method, Request, RequestLine, Response};

/// Copies the headers shared by ACK and CANCEL (RFC 3261 §17.1.1.3, §9.1).
///
/// Only the top Via is kept, so the generated request travels on the same
/// branch as the INVITE. `to` overrides the INVITE's To header.
fn in_transaction_headers(invite: &Request, method: Method, to: Option<&str>) -> Headers {
    let mut headers = Headers::new();
    if let Some(via) = invite.headers.get("Via") {
        let top = sip_core::split_list(via)
            .into_iter()
            .next()
            .unwrap_or_else(|| via.clone());
        headers.push("Via", top);
    }
    for route in invite.headers.get_all("Route") {
        headers.push("Route", route.clone());
    }
    headers.push("Max-Forwards", "70");
    if let Some(from) = invite.headers.get("From") {
        headers.push("From", from.clone());
    }
    match to {
        Some(to) => headers.push("To", to),
        None => {
            if let Some(to) = invite.headers.get("To") {
                headers.push("To", to.clone());
            }
        }
    }
    if let Some(call_id) = invite.headers.get("Call-ID") {
        headers.push("Call-ID", call_id.clone());
    }
    let seq = invite
        .headers
        .get("CSeq")
        .and_then(|raw| CSeq::parse(raw))
        .map_or(1, |cseq| cseq.seq);
    headers.push("CSeq", CSeq { seq, method: method.clone() }.to_string());
    headers
}

/// ACK for a non-2xx final response to `invite`.
///
/// The To header (and its tag) comes from the response.
pub fn build_ack(invite: &Request, response: &Response) -> Request {
    let to = response.headers.get("To").map(|to| to.as_str());
    Request {
        start: RequestLine::new(Method::Ack, invite.uri().clone()),
        headers: in_transaction_headers(invite, Method::Ack, to),
        body: Bytes::new(),
    }
}

/// CANCEL for a pending `invite`.
pub fn build_cancel(invite: &Request) -> Request {
    Request {
        start: RequestLine::new(Method::Cancel, invite.uri().clone()),
        headers: in_transaction_headers(invite, Method::Cancel, None),
        body: Bytes::new(),
    }
}
