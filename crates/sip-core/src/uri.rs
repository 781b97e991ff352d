// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

/// Parsed representation of a SIP URI (RFC 3261 §19).
///
/// Only the parts needed for routing are broken out; the original text is
/// kept verbatim so serialization never rewrites what a peer sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    raw: SmolStr,
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl SipUri {
    /// Attempts to parse a SIP or SIPS URI from the provided string.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (scheme, rest) = input.split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        let addr_part = rest.split_once('?').map_or(rest, |(addr, _)| addr);
        let mut addr_iter = addr_part.split(';');
        let base = addr_iter.next()?.trim();
        let params = addr_iter
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                ),
                None => (SmolStr::new(p.to_ascii_lowercase()), None),
            })
            .collect();

        let (user, host_port) = match base.rsplit_once('@') {
            Some((user, host)) => (
                percent_decode_str(user.trim())
                    .decode_utf8()
                    .ok()
                    .map(|s| SmolStr::new(s.as_ref())),
                host.trim(),
            ),
            None => (None, base),
        };
        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return None;
        }

        Some(Self {
            raw: SmolStr::new(input),
            sips,
            user,
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
            params,
        })
    }

    /// Returns the original textual representation of the URI.
    pub fn as_str(&self) -> &str {
        self.raw.as_str()
    }

    /// Looks up a URI parameter by name (case-insensitive).
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Returns the `transport=` parameter, if any.
    pub fn transport_param(&self) -> Option<&str> {
        self.param("transport").flatten()
    }

    /// Returns the explicit port or the scheme default (5060 / 5061).
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(if self.sips { 5061 } else { 5060 })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-URI of a SIP request.
///
/// SIP and SIPS URIs are parsed; any other scheme (tel, urn, http, ...) is
/// carried as opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Uri {
    Sip(SipUri),
    Other(SmolStr),
}

impl Uri {
    /// Parses a URI, returning `None` when it has no scheme.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (scheme, rest) = input.split_once(':')?;
        if scheme.is_empty()
            || rest.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return None;
        }
        if scheme.eq_ignore_ascii_case("sip") || scheme.eq_ignore_ascii_case("sips") {
            SipUri::parse(input).map(Uri::Sip)
        } else {
            Some(Uri::Other(SmolStr::new(input)))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Uri::Sip(uri) => uri.as_str(),
            Uri::Other(raw) => raw.as_str(),
        }
    }

    pub fn as_sip(&self) -> Option<&SipUri> {
        match self {
            Uri::Sip(uri) => Some(uri),
            Uri::Other(_) => None,
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SipUri> for Uri {
    fn from(uri: SipUri) -> Self {
        Uri::Sip(uri)
    }
}

/// Splits a host[:port] or IPv6 literal "[host]:port" string.
pub fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if let Some(stripped) = input.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &stripped[..end];
        match stripped[end + 1..].strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None => Some((host, None)),
        }
    } else if let Some((host, port)) = input.rsplit_once(':') {
        if host.contains(':') {
            return None;
        }
        Some((host, Some(port.parse().ok()?)))
    } else {
        Some((input, None))
    }
}
