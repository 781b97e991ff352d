// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

use crate::uri::split_host_port;

/// RFC 3261 branch prefix identifying compliant transaction ids.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

const MAX_BRANCH_LENGTH: usize = 256;

/// Returns `true` when the branch carries the RFC 3261 magic cookie.
pub fn is_rfc3261_branch(branch: &str) -> bool {
    branch.len() > MAGIC_COOKIE.len()
        && branch.len() <= MAX_BRANCH_LENGTH
        && branch.starts_with(MAGIC_COOKIE)
}

/// Generates a fresh RFC 3261 compliant branch id.
pub fn generate_branch() -> SmolStr {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{MAGIC_COOKIE}{suffix}"))
}

/// Generates a random tag for From/To headers.
pub fn generate_tag() -> SmolStr {
    let tag: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    SmolStr::new(tag)
}

/// Parsed representation of a single Via header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    /// Protocol name and version, normally `SIP/2.0`.
    pub protocol: SmolStr,
    pub transport: SmolStr,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl ViaHeader {
    /// Builds a Via for a locally originated request.
    pub fn new(transport: &str, sent_by: &str, branch: &str) -> Self {
        let (host, port) = split_host_port(sent_by).unwrap_or((sent_by, None));
        Self {
            protocol: SmolStr::new("SIP/2.0"),
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            host: SmolStr::new(host),
            port,
            params: vec![(SmolStr::new("branch"), Some(SmolStr::new(branch)))],
        }
    }

    /// Parses one Via element such as `SIP/2.0/UDP host:5060;branch=z9hG4bK1`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split(';');
        let sent = parts.next()?.trim();
        let (proto, sent_by) = sent.split_once(|c: char| c.is_ascii_whitespace())?;
        let (protocol, transport) = proto.trim().rsplit_once('/')?;
        if protocol.is_empty() || transport.is_empty() {
            return None;
        }
        let sent_by = sent_by.trim();
        let (host, port) = split_host_port(sent_by)?;
        if host.is_empty() {
            return None;
        }
        let params = parts
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (SmolStr::new(k.trim()), Some(SmolStr::new(v.trim()))),
                None => (SmolStr::new(p), None),
            })
            .collect();
        Some(Self {
            protocol: SmolStr::new(protocol.trim()),
            transport: SmolStr::new(transport.trim()),
            host: SmolStr::new(host),
            port,
            params,
        })
    }

    pub fn transport(&self) -> &str {
        self.transport.as_str()
    }

    /// Looks up a parameter ignoring ASCII case.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch").flatten()
    }

    /// Sets or replaces a parameter, keeping its position when present.
    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(SmolStr::new);
        match self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.params.push((SmolStr::new(name), value)),
        }
    }

    pub fn set_branch(&mut self, branch: &str) {
        self.set_param("branch", Some(branch));
    }

    /// `host[:port]` as sent.
    pub fn sent_by(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.to_string()
        };
        match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        }
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.protocol, self.transport, self.sent_by())?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{name}={value}")?,
                None => write!(f, ";{name}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_branch_has_magic_cookie() {
        let branch = generate_branch();
        assert!(is_rfc3261_branch(&branch));
        assert_eq!(branch.len(), MAGIC_COOKIE.len() + 16);
        assert_ne!(branch, generate_branch());
    }

    #[test]
    fn legacy_branches_are_not_rfc3261() {
        assert!(!is_rfc3261_branch("0"));
        assert!(!is_rfc3261_branch(MAGIC_COOKIE));
        assert!(!is_rfc3261_branch("1234abcd"));
    }

    #[test]
    fn parses_and_prints_via() {
        let via = ViaHeader::parse("SIP/2.0/UDP 10.0.0.1:5062;branch=z9hG4bKabc;rport").unwrap();
        assert_eq!(via.transport(), "UDP");
        assert_eq!(via.host, "10.0.0.1");
        assert_eq!(via.port, Some(5062));
        assert_eq!(via.branch(), Some("z9hG4bKabc"));
        assert_eq!(via.param("rport"), Some(None));
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP 10.0.0.1:5062;branch=z9hG4bKabc;rport"
        );
    }

    #[test]
    fn set_branch_replaces_in_place() {
        let mut via = ViaHeader::parse("SIP/2.0/TCP host;branch=old;x=1").unwrap();
        via.set_branch("z9hG4bKnew");
        assert_eq!(via.to_string(), "SIP/2.0/TCP host;branch=z9hG4bKnew;x=1");
        via.set_param("received", Some("192.0.2.1"));
        assert_eq!(via.param("received"), Some(Some("192.0.2.1")));
    }

    #[test]
    fn rejects_garbage() {
        assert!(ViaHeader::parse("nonsense").is_none());
        assert!(ViaHeader::parse("SIP/2.0/UDP ;branch=x").is_none());
    }
}
