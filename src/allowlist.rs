//! Trusted-origin bypass.
//!
//! Requests from allowlisted addresses skip token verification entirely.
//! The client address is taken from the first `X-Forwarded-For` entry when
//! present, so the gateway must sit behind a front layer that sets that
//! header honestly.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use ipnet::IpNet;
use tracing::warn;

use crate::error::AuthError;

/// Header consulted before the transport peer address.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Exact addresses and CIDR blocks whose requests bypass authentication.
#[derive(Debug, Clone, Default)]
pub struct OriginAllowlist {
    addrs: Vec<IpAddr>,
    nets: Vec<IpNet>,
}

impl OriginAllowlist {
    /// Build from configured entries.
    ///
    /// Entries containing `/` must be valid CIDR blocks. Unparsable exact
    /// addresses are logged and left out.
    pub fn new<I, S>(entries: I) -> Result<Self, AuthError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowlist = Self::default();

        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }

            if entry.contains('/') {
                let net: IpNet = entry.parse().map_err(|e: ipnet::AddrParseError| {
                    AuthError::InvalidAllowlistEntry {
                        entry: entry.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                allowlist.nets.push(net);
            } else {
                match entry.parse::<IpAddr>() {
                    Ok(addr) => allowlist.addrs.push(addr.to_canonical()),
                    Err(e) => warn!(entry = %entry, error = %e, "Ignoring malformed allowlist address"),
                }
            }
        }

        Ok(allowlist)
    }

    /// Number of usable entries (addresses plus blocks).
    #[must_use]
    pub fn len(&self) -> usize {
        self.addrs.len() + self.nets.len()
    }

    /// True when nothing is allowlisted; no request can bypass.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.nets.is_empty()
    }

    /// Whether the request's client address is trusted.
    #[must_use]
    pub fn is_allowed(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> bool {
        if self.is_empty() {
            return false;
        }

        client_ip(headers, peer).is_some_and(|ip| self.contains(ip))
    }

    /// Whether `ip` equals an allowlisted address or lies in a block.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.addrs.contains(&ip) || self.nets.iter().any(|net| net_contains(net, ip))
    }
}

/// Block membership that also accepts IPv4-mapped IPv6 forms.
fn net_contains(net: &IpNet, ip: IpAddr) -> bool {
    if net.contains(&ip) {
        return true;
    }
    match (net, ip) {
        (IpNet::V6(v6), IpAddr::V4(v4)) => v6.contains(&v4.to_ipv6_mapped()),
        _ => false,
    }
}

/// Resolve the client address: first `X-Forwarded-For` entry, else the peer.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| peer.map(|addr| addr.ip()))
}
