//! Listen-interface resolution.
//!
//! A listen-interface spec is `virtual`, `0.0.0.0`, a concrete IP, or an
//! interface name. The first three pass through untouched; names are
//! resolved to their first non-loopback IPv4 address (loopback is allowed
//! only when the name itself is the loopback interface).

use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("not a valid interface name or IP address: {0}")]
    NoSuchInterface(String),

    #[error("no IPv4 address found on interface {0}")]
    NoIpv4(String),

    #[error("interface enumeration is not supported on this platform")]
    Unsupported,
}

/// Resolve a listen-interface spec to something bindable.
pub fn resolve_interface_to_ip(spec: &str) -> Result<String, ResolveError> {
    if spec == "virtual" || spec == "0.0.0.0" {
        return Ok(spec.to_string());
    }

    if spec.parse::<IpAddr>().is_ok() {
        return Ok(spec.to_string());
    }

    let ip = first_ipv4_of_interface(spec)?;
    info!(interface = spec, ip = %ip, "resolved interface to IP");
    Ok(ip.to_string())
}

/// Whether `ip` is configured on any local interface.
///
/// Used to reject listen addresses that would silently fail to bind; on
/// platforms without interface enumeration the check is skipped.
pub fn ip_exists_on_machine(ip: &str) -> bool {
    let Ok(target) = ip.parse::<IpAddr>() else {
        return false;
    };

    match local_addresses() {
        Some(addrs) => addrs.iter().any(|(_, addr)| *addr == target),
        None => true,
    }
}

/// `name: ip` pairs for every local IPv4 address, for diagnostics.
pub fn list_available_interfaces() -> Vec<String> {
    local_addresses()
        .unwrap_or_default()
        .into_iter()
        .filter(|(_, addr)| addr.is_ipv4())
        .map(|(name, addr)| format!("{name}: {addr}"))
        .collect()
}

fn first_ipv4_of_interface(name: &str) -> Result<Ipv4Addr, ResolveError> {
    let addrs = local_addresses().ok_or(ResolveError::Unsupported)?;

    let mut found_interface = false;
    let loopback_requested = name == "lo" || name == "lo0";

    for (if_name, addr) in addrs {
        if if_name != name {
            continue;
        }
        found_interface = true;

        let IpAddr::V4(v4) = addr else { continue };
        if v4.is_loopback() && !loopback_requested {
            continue;
        }
        return Ok(v4);
    }

    if found_interface {
        Err(ResolveError::NoIpv4(name.to_string()))
    } else {
        Err(ResolveError::NoSuchInterface(name.to_string()))
    }
}

#[cfg(unix)]
fn local_addresses() -> Option<Vec<(String, IpAddr)>> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;

    let mut result = Vec::new();
    for ifaddr in addrs {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            result.push((ifaddr.interface_name.clone(), IpAddr::V4(sin.ip())));
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            result.push((ifaddr.interface_name.clone(), IpAddr::V6(sin6.ip())));
        }
    }
    Some(result)
}

#[cfg(not(unix))]
fn local_addresses() -> Option<Vec<(String, IpAddr)>> {
    None
}
