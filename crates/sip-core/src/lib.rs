// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types shared by the protocol engine.
//!
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **Headers**: [`Headers`], an ordered multimap with compact-name aliasing
//! - **Methods**: [`Method`]
//! - **URIs**: [`SipUri`] and the request-line [`Uri`]
//! - **Via / branch**: [`ViaHeader`], [`MAGIC_COOKIE`], [`generate_branch`]

pub mod headers;
pub mod method;
pub mod msg;
pub mod uri;
pub mod via;

pub use headers::{canonical_name, compact_form, split_list, Header, Headers};
pub use method::Method;
pub use msg::{
    has_tag, replace_top_via, top_via, CSeq, MessageError, Request, RequestLine, Response,
    SipMessage, SipVersion, StatusLine,
};
pub use uri::{SipUri, Uri};
pub use via::{generate_branch, generate_tag, is_rfc3261_branch, ViaHeader, MAGIC_COOKIE};
