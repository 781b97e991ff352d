// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Next-hop resolution seam and failed-hop blacklist.
//!
//! The manager treats the resolver's output purely as an ordered failover
//! list; how the list is produced (RFC 3263, static routes, ...) is up to the
//! [`Resolver`] implementation.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sip_core::SipUri;
use sip_transport::TransportKind;
use tokio::time::Instant;

/// Default time a failed hop stays blacklisted.
pub const DEFAULT_BLACKLIST_DURATION: Duration = Duration::from_secs(300);

/// One candidate destination for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hop {
    pub addr: SocketAddr,
    pub transport: TransportKind,
}

impl Hop {
    pub fn new(addr: SocketAddr, transport: TransportKind) -> Self {
        Self { addr, transport }
    }
}

/// Produces the ordered hop list for a target URI.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<Hop>>;
}

/// Transport implied by a URI: explicit `transport=` wins, then `sips:`.
pub fn uri_transport(uri: &SipUri) -> TransportKind {
    uri.transport_param()
        .and_then(TransportKind::parse)
        .unwrap_or(if uri.sips {
            TransportKind::Tls
        } else {
            TransportKind::Udp
        })
}

/// Resolves numeric hosts directly and names through the system resolver.
///
/// No SRV or NAPTR: every address returned for the host becomes one hop, in
/// the order the system returns them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<Hop>> {
        let transport = uri_transport(uri);
        let port = uri.port.unwrap_or(match transport {
            TransportKind::Tls => 5061,
            _ => 5060,
        });
        let host = uri.host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![Hop::new(SocketAddr::new(ip, port), transport)]);
        }
        let hops: Vec<Hop> = tokio::net::lookup_host((host, port))
            .await?
            .map(|addr| Hop::new(addr, transport))
            .collect();
        if hops.is_empty() {
            return Err(anyhow!("no addresses for {}", uri.host));
        }
        Ok(hops)
    }
}

/// Fixed hop list, for outbound proxies and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver(pub Vec<Hop>);

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, _uri: &SipUri) -> Result<Vec<Hop>> {
        Ok(self.0.clone())
    }
}

/// Hops that recently failed, with their expiry.
#[derive(Debug)]
pub struct HopBlacklist {
    entries: DashMap<Hop, Instant>,
    duration: Duration,
}

impl HopBlacklist {
    pub fn new(duration: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            duration,
        }
    }

    pub fn insert(&self, hop: Hop) {
        self.entries.insert(hop, Instant::now() + self.duration);
    }

    /// Whether `hop` is still blacklisted. Expired entries are evicted.
    pub fn contains(&self, hop: &Hop) -> bool {
        let now = Instant::now();
        let expired = match self.entries.get(hop) {
            None => return false,
            Some(until) => *until <= now,
        };
        if expired {
            self.entries.remove_if(hop, |_, until| *until <= now);
            return false;
        }
        true
    }

    pub fn remove(&self, hop: &Hop) {
        self.entries.remove(hop);
    }

    /// Drops blacklisted hops from `hops`, keeping order.
    pub fn filter(&self, hops: Vec<Hop>) -> Vec<Hop> {
        hops.into_iter().filter(|hop| !self.contains(hop)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HopBlacklist {
    fn default() -> Self {
        Self::new(DEFAULT_BLACKLIST_DURATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(port: u16) -> Hop {
        Hop::new(SocketAddr::from(([127, 0, 0, 1], port)), TransportKind::Udp)
    }

    #[tokio::test]
    async fn numeric_hosts_skip_lookup() {
        let uri = SipUri::parse("sip:bob@192.0.2.10").unwrap();
        let hops = SystemResolver.resolve(&uri).await.unwrap();
        assert_eq!(
            hops,
            vec![Hop::new("192.0.2.10:5060".parse().unwrap(), TransportKind::Udp)]
        );
    }

    #[tokio::test]
    async fn transport_param_and_sips_pick_transport_and_port() {
        let uri = SipUri::parse("sip:bob@192.0.2.10:5080;transport=tcp").unwrap();
        let hops = SystemResolver.resolve(&uri).await.unwrap();
        assert_eq!(hops[0].transport, TransportKind::Tcp);
        assert_eq!(hops[0].addr.port(), 5080);

        let uri = SipUri::parse("sips:bob@[2001:db8::1]").unwrap();
        let hops = SystemResolver.resolve(&uri).await.unwrap();
        assert_eq!(hops[0].transport, TransportKind::Tls);
        assert_eq!(hops[0].addr, "[2001:db8::1]:5061".parse().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn blacklist_expires() {
        let blacklist = HopBlacklist::new(Duration::from_secs(10));
        blacklist.insert(hop(5060));
        assert_eq!(blacklist.filter(vec![hop(5060), hop(5070)]), vec![hop(5070)]);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!blacklist.contains(&hop(5060)));
        assert!(blacklist.is_empty());
    }
}
