// Client IP resolution
//
// Proxy and CDN headers are consulted in a fixed order and the first public
// address wins; the socket address is the fallback. Any client can forge these
// headers, so they are only honoured when `trust_proxy_headers` is on, which
// is correct only behind a proxy that overwrites them.

use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Headers checked for the originating client, in priority order
pub const PROXY_HEADERS: [&str; 7] = [
    "cf-connecting-ip",
    "x-client-ip",
    "x-forwarded-for",
    "x-forwarded",
    "x-cluster-client-ip",
    "forwarded-for",
    "forwarded",
];

/// Placeholder used when neither headers nor the socket yield an address
pub const UNKNOWN_IP: &str = "unknown";

/// Resolve the caller's IP address as a string
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers
        && let Some(ip) = ip_from_headers(headers)
    {
        return ip.to_string();
    }

    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

fn ip_from_headers(headers: &HeaderMap) -> Option<IpAddr> {
    for name in PROXY_HEADERS {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };

        let candidate = if name == "forwarded" {
            forwarded_for(value)
        } else {
            // Only the first hop is the client; later entries are proxies
            value.split(',').next().map(str::trim)
        };

        if let Some(ip) = candidate.and_then(parse_ip)
            && is_public_ip(&ip)
        {
            return Some(ip);
        }
    }
    None
}

/// First `for=` parameter of an RFC 7239 `Forwarded` header
fn forwarded_for(value: &str) -> Option<&str> {
    let first_element = value.split(',').next()?;
    first_element
        .split(';')
        .map(str::trim)
        .find_map(|pair| {
            let (key, val) = pair.split_once('=')?;
            key.trim().eq_ignore_ascii_case("for").then_some(val.trim())
        })
}

/// Parse an address that may be quoted, bracketed or carry a port
fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim().trim_matches('"');
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }
    // "[2001:db8::1]:443"
    if let Some(rest) = raw.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }
    // "203.0.113.9:51234"
    let (host, _port) = raw.rsplit_once(':')?;
    host.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
}

/// True for globally routable addresses (not private, loopback, link-local,
/// documentation, multicast or otherwise reserved)
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => is_public_v6(v6),
    }
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        // 0.0.0.0/8 "this network"
        || octets[0] == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // 192.0.0.0/24 protocol assignments
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // 198.18.0.0/15 benchmarking
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || octets[0] >= 240)
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_v4(&v4);
    }
    let segments = ip.segments();
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (segments[0] & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (segments[0] == 0x2001 && segments[1] == 0x0db8))
}
