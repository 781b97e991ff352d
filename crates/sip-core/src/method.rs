// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use smol_str::SmolStr;

/// SIP request methods supported by the stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Update,
    Message,
    Prack,
    Refer,
    Subscribe,
    Notify,
    Publish,
    Unknown(SmolStr),
}

const KNOWN: &[(Method, &str)] = &[
    (Method::Invite, "INVITE"),
    (Method::Ack, "ACK"),
    (Method::Bye, "BYE"),
    (Method::Cancel, "CANCEL"),
    (Method::Register, "REGISTER"),
    (Method::Options, "OPTIONS"),
    (Method::Info, "INFO"),
    (Method::Update, "UPDATE"),
    (Method::Message, "MESSAGE"),
    (Method::Prack, "PRACK"),
    (Method::Refer, "REFER"),
    (Method::Subscribe, "SUBSCRIBE"),
    (Method::Notify, "NOTIFY"),
    (Method::Publish, "PUBLISH"),
];

impl Method {
    /// Returns the uppercase wire token.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Unknown(token) => token.as_str(),
            known => KNOWN
                .iter()
                .find(|(m, _)| m == known)
                .map_or("", |(_, token)| token),
        }
    }

    /// Parses a method token. Method names are case-sensitive on the wire
    /// (RFC 3261 §7.1), so `invite` is an extension method.
    pub fn from_token(token: &str) -> Self {
        KNOWN
            .iter()
            .find(|(_, t)| *t == token)
            .map(|(m, _)| m.clone())
            .unwrap_or_else(|| Method::Unknown(SmolStr::new(token)))
    }

    /// INVITE-class requests get the INVITE transaction machines.
    pub fn is_invite(&self) -> bool {
        matches!(self, Method::Invite)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
