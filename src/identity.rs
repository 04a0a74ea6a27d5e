//! Client identity resolution.
//!
//! Works out which actor a call belongs to from its transport peer address
//! and, when trusted, the `X-Forwarded-For` header set by a reverse proxy.
//!
//! # Security
//!
//! Trusting the forwarded header is a security decision. If nothing in front
//! of the service strips or overwrites `X-Forwarded-For`, any client can put
//! an arbitrary address there, claim a fresh identity on every call and slip
//! past every per-actor limit. Only enable `trust_forwarded_header` behind a
//! reverse proxy that sets the header, and prefer pinning that proxy with
//! `trusted_proxies`.

use std::net::{IpAddr, SocketAddr};

use http::HeaderMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity used when no peer address can be determined.
pub const UNKNOWN_ACTOR: &str = "unknown";

/// Header carrying the proxy chain, closest client first.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Identity resolution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Use the forwarded header when present. Spoofable without a proxy.
    #[serde(default = "default_trust_forwarded_header")]
    pub trust_forwarded_header: bool,

    /// When non-empty, the forwarded header is only honored for peers inside
    /// one of these networks, e.g. `["10.0.0.0/8"]`.
    #[serde(default)]
    pub trusted_proxies: Vec<IpNet>,
}

fn default_trust_forwarded_header() -> bool {
    true
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trust_forwarded_header: default_trust_forwarded_header(),
            trusted_proxies: Vec::new(),
        }
    }
}

/// The parts of an inbound call that identify its sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    /// Address of the directly connected peer
    pub peer_addr: Option<IpAddr>,
    /// Raw value of the forwarded-for header
    pub forwarded_for: Option<String>,
}

impl RequestMetadata {
    /// Metadata for a call from `peer_addr` with no forwarded header.
    pub fn new(peer_addr: Option<IpAddr>) -> Self {
        Self {
            peer_addr,
            forwarded_for: None,
        }
    }

    /// Attach a forwarded-for header value.
    pub fn with_forwarded_for(mut self, value: &str) -> Self {
        self.forwarded_for = Some(value.to_string());
        self
    }

    /// Build metadata from an HTTP request's peer and headers.
    ///
    /// Header values that are not visible ASCII are ignored.
    pub fn from_headers(peer: Option<SocketAddr>, headers: &HeaderMap) -> Self {
        Self {
            peer_addr: peer.map(|addr| addr.ip()),
            forwarded_for: headers
                .get(FORWARDED_FOR_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        }
    }
}

/// Resolves the actor identifier for a call.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentityResolver {
    config: IdentityConfig,
}

impl ClientIdentityResolver {
    /// Create a resolver.
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    /// Get the resolver settings.
    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    /// Resolve the actor for a call. Never fails; falls back to
    /// [`UNKNOWN_ACTOR`] when nothing identifies the sender.
    pub fn resolve(&self, metadata: &RequestMetadata) -> String {
        if self.trusts_header_from(metadata.peer_addr) {
            if let Some(client) = metadata.forwarded_for.as_deref().and_then(first_forwarded) {
                return client.to_string();
            }
        }

        match metadata.peer_addr {
            Some(peer) => peer.to_string(),
            None => {
                debug!("No peer address for call, using sentinel identity");
                UNKNOWN_ACTOR.to_string()
            }
        }
    }

    fn trusts_header_from(&self, peer: Option<IpAddr>) -> bool {
        if !self.config.trust_forwarded_header {
            return false;
        }
        if self.config.trusted_proxies.is_empty() {
            return true;
        }

        let trusted = peer.is_some_and(|ip| {
            self.config
                .trusted_proxies
                .iter()
                .any(|net| net.contains(&ip))
        });
        if !trusted {
            debug!(peer = ?peer, "Peer is not a trusted proxy, ignoring forwarded header");
        }
        trusted
    }
}

/// First entry of a forwarded-for list, if it is non-empty.
fn first_forwarded(value: &str) -> Option<&str> {
    value
        .split(',')
        .next()
        .map(str::trim)
        .filter(|first| !first.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn peer(ip: &str) -> Option<IpAddr> {
        Some(ip.parse().unwrap())
    }

    fn resolver(trust: bool) -> ClientIdentityResolver {
        ClientIdentityResolver::new(IdentityConfig {
            trust_forwarded_header: trust,
            trusted_proxies: Vec::new(),
        })
    }

    #[test]
    fn test_trusted_header_uses_first_entry() {
        let metadata = RequestMetadata::new(peer("10.0.0.1")).with_forwarded_for("203.0.113.5, 10.0.0.1");
        assert_eq!(resolver(true).resolve(&metadata), "203.0.113.5");
    }

    #[test]
    fn test_untrusted_header_is_ignored() {
        let metadata = RequestMetadata::new(peer("10.0.0.1")).with_forwarded_for("203.0.113.5, 10.0.0.1");
        assert_eq!(resolver(false).resolve(&metadata), "10.0.0.1");
    }

    #[test]
    fn test_missing_header_uses_peer() {
        let metadata = RequestMetadata::new(peer("192.0.2.7"));
        assert_eq!(resolver(true).resolve(&metadata), "192.0.2.7");
    }

    #[test]
    fn test_blank_header_or_first_entry_uses_peer() {
        let resolver = resolver(true);

        let metadata = RequestMetadata::new(peer("192.0.2.7")).with_forwarded_for("   ");
        assert_eq!(resolver.resolve(&metadata), "192.0.2.7");

        let metadata = RequestMetadata::new(peer("192.0.2.7")).with_forwarded_for(" , 10.0.0.1");
        assert_eq!(resolver.resolve(&metadata), "192.0.2.7");
    }

    #[test]
    fn test_no_peer_is_unknown() {
        assert_eq!(resolver(true).resolve(&RequestMetadata::default()), UNKNOWN_ACTOR);
        assert_eq!(
            resolver(false).resolve(&RequestMetadata::new(None).with_forwarded_for("203.0.113.5")),
            UNKNOWN_ACTOR
        );
    }

    #[test]
    fn test_header_trusted_without_peer_when_no_proxy_list() {
        let metadata = RequestMetadata::new(None).with_forwarded_for("203.0.113.5");
        assert_eq!(resolver(true).resolve(&metadata), "203.0.113.5");
    }

    #[test]
    fn test_trusted_proxy_list() {
        let resolver = ClientIdentityResolver::new(IdentityConfig {
            trust_forwarded_header: true,
            trusted_proxies: vec!["10.0.0.0/8".parse().unwrap()],
        });

        let via_proxy = RequestMetadata::new(peer("10.1.2.3")).with_forwarded_for("203.0.113.5");
        assert_eq!(resolver.resolve(&via_proxy), "203.0.113.5");

        let direct = RequestMetadata::new(peer("198.51.100.9")).with_forwarded_for("203.0.113.5");
        assert_eq!(resolver.resolve(&direct), "198.51.100.9");

        let no_peer = RequestMetadata::new(None).with_forwarded_for("203.0.113.5");
        assert_eq!(resolver.resolve(&no_peer), UNKNOWN_ACTOR);
    }

    #[test]
    fn test_ipv6_peer() {
        let metadata = RequestMetadata::new(peer("2001:db8::1"));
        assert_eq!(resolver(true).resolve(&metadata), "2001:db8::1");
    }

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("203.0.113.5, 10.0.0.1"));
        let addr: SocketAddr = "10.0.0.1:51234".parse().unwrap();

        let metadata = RequestMetadata::from_headers(Some(addr), &headers);
        assert_eq!(metadata.peer_addr, peer("10.0.0.1"));
        assert_eq!(metadata.forwarded_for.as_deref(), Some("203.0.113.5, 10.0.0.1"));

        let metadata = RequestMetadata::from_headers(Some(addr), &HeaderMap::new());
        assert!(metadata.forwarded_for.is_none());
    }

    #[test]
    fn test_config_defaults_to_trust() {
        let config: IdentityConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.trust_forwarded_header);
        assert!(config.trusted_proxies.is_empty());
    }
}
