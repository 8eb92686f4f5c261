//! Hostname/port resolution collaborator.
//!
//! Maps a hostname (or dotted-quad) and port to a single IPv4
//! [`SocketAddr`]. This is deliberately thin: one resolution attempt, no
//! caching, IPv6 results are discarded rather than returned.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::error::ConfigError;

/// Validates `port` is in `1..=65535`.
pub fn validate_port(port: u32) -> Result<u16, ConfigError> {
    if port == 0 || port > u32::from(u16::MAX) {
        return Err(ConfigError::PortOutOfRange(port));
    }
    Ok(port as u16)
}

/// Parses a strict IPv4 dotted-quad, rejecting anything else (hostnames,
/// IPv6 literals, etc).
pub fn parse_ipv4(addr: &str) -> Result<Ipv4Addr, ConfigError> {
    addr.parse::<Ipv4Addr>().map_err(|_| ConfigError::InvalidIpv4(addr.to_string()))
}

/// Resolves `host` to an IPv4 socket address.
///
/// If `host` already parses as a dotted-quad it is used directly (no
/// resolver round-trip). Otherwise the platform resolver is consulted and
/// the first IPv4 result is taken; if the resolver returns only IPv6
/// addresses (or none), this is a [`ConfigError`], not a panic.
pub fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    if let Ok(ip) = parse_ipv4(host) {
        return Ok(SocketAddr::from((ip, port)));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|_| ConfigError::UnresolvableHost(host.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ConfigError::UnresolvableHost(host.to_string()))
}
