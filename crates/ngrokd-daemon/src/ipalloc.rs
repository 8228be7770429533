//! Per-hostname IP allocation within the configured subnet.
//!
//! Assignments are sticky: a hostname keeps its IP until released, and the
//! mapping is persisted as JSON so restarts hand the same addresses back.
//! The cursor starts at network+2 (network and gateway addresses are
//! reserved) and, after a reload, resumes past the largest persisted
//! address so new hostnames never collide with old ones.

use ipnet::Ipv4Net;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

const FALLBACK_SUBNET: &str = "10.107.0.0/16";

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("exhausted IP range in subnet {0}")]
    Exhausted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse persisted mappings: {0}")]
    Parse(#[from] serde_json::Error),
}

struct Inner {
    next: Ipv4Addr,
    allocated: HashMap<String, Ipv4Addr>,
}

/// Allocates IPv4 addresses from a subnet, one per hostname.
pub struct Allocator {
    subnet: Ipv4Net,
    inner: Mutex<Inner>,
}

impl Allocator {
    /// Create an allocator over `subnet`; an unparseable subnet falls back
    /// to the default range rather than failing startup.
    pub fn new(subnet: &str) -> Self {
        let net = subnet.parse::<Ipv4Net>().unwrap_or_else(|e| {
            tracing::error!(subnet, error = %e, "invalid subnet, falling back to {FALLBACK_SUBNET}");
            FALLBACK_SUBNET.parse().unwrap()
        });

        Self {
            subnet: net,
            inner: Mutex::new(Inner {
                next: first_assignable(&net),
                allocated: HashMap::new(),
            }),
        }
    }

    /// Allocate (or return the existing) IP for `hostname`.
    ///
    /// The port is part of the endpoint identity for logging; two endpoints
    /// on the same hostname share the hostname's address.
    pub fn allocate_ip_for_port(&self, hostname: &str, port: u16) -> Result<Ipv4Addr, AllocError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(ip) = inner.allocated.get(hostname) {
            return Ok(*ip);
        }

        let mut candidate = inner.next;
        loop {
            if !self.subnet.contains(&candidate) {
                return Err(AllocError::Exhausted(self.subnet.to_string()));
            }
            if !inner.allocated.values().any(|used| *used == candidate) {
                inner.allocated.insert(hostname.to_string(), candidate);
                inner.next = next_ip(candidate);
                info!(hostname, port, ip = %candidate, "allocated IP");
                return Ok(candidate);
            }
            candidate = next_ip(candidate);
        }
    }

    /// Release the allocation for a hostname, if any.
    pub fn release_ip(&self, hostname: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ip) = inner.allocated.remove(hostname) {
            info!(hostname, ip = %ip, "released IP");
        }
    }

    /// Snapshot of all hostname → IP assignments.
    pub fn all_mappings(&self) -> HashMap<String, Ipv4Addr> {
        self.inner.lock().unwrap().allocated.clone()
    }

    /// Load persisted mappings; a missing file is not an error. The cursor
    /// advances past the largest in-subnet address seen.
    pub fn load(&self, path: &Path) -> Result<(), AllocError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mappings = HashMap::<String, StoredIp>::deserialize(
            &mut serde_json::Deserializer::from_str(&data),
        )?;

        let mut inner = self.inner.lock().unwrap();
        inner.allocated = mappings
            .into_iter()
            .map(|(host, StoredIp(ip))| (host, ip))
            .collect();

        let max_in_subnet = inner
            .allocated
            .values()
            .filter(|ip| self.subnet.contains(*ip))
            .max()
            .copied();

        if let Some(max) = max_in_subnet {
            inner.next = next_ip(max);
            info!(next = %inner.next, "resuming IP allocation");
        }

        info!(count = inner.allocated.len(), "loaded persistent IP mappings");
        Ok(())
    }

    /// Persist mappings atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), AllocError> {
        let mappings: HashMap<String, String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .allocated
                .iter()
                .map(|(host, ip)| (host.clone(), ip.to_string()))
                .collect()
        };

        let data = serde_json::to_string_pretty(&mappings)?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, path)?;
        debug!(path = %path.display(), count = mappings.len(), "saved IP mappings");
        Ok(())
    }
}

// Persisted as dotted-quad strings.
struct StoredIp(Ipv4Addr);

impl<'de> Deserialize<'de> for StoredIp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<Ipv4Addr>()
            .map(StoredIp)
            .map_err(serde::de::Error::custom)
    }
}

fn first_assignable(net: &Ipv4Net) -> Ipv4Addr {
    // Skip the network address and the .1 gateway.
    Ipv4Addr::from(u32::from(net.network()) + 2)
}

fn next_ip(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(1))
}

/// Extract `(hostname, port)` from an endpoint URL, applying the scheme
/// default when no port is present (443 for https and tcp-with-tls, 80 for
/// http).
pub fn parse_hostname(url: &str) -> Result<(String, u16), String> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| format!("invalid URI format: {url}"))?;

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) if port_str.chars().all(|c| c.is_ascii_digit()) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| format!("invalid port in {url}"))?;
            (host.to_string(), port)
        }
        _ => {
            let default = match scheme {
                "https" | "tcp-with-tls" => 443,
                "http" => 80,
                _ => return Err(format!("cannot determine port for {url}")),
            };
            (rest.to_string(), default)
        }
    };

    if host.is_empty() {
        return Err(format!("no host in {url}"));
    }
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn allocates_sequentially_from_dot_two() {
        let alloc = Allocator::new("10.107.0.0/16");

        let a = alloc.allocate_ip_for_port("a.example", 443).unwrap();
        let b = alloc.allocate_ip_for_port("b.example", 5432).unwrap();

        assert_eq!(a, "10.107.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b, "10.107.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn same_hostname_keeps_its_ip() {
        let alloc = Allocator::new("10.107.0.0/16");

        let first = alloc.allocate_ip_for_port("a.example", 443).unwrap();
        let again = alloc.allocate_ip_for_port("a.example", 8443).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn released_hostname_reappears_with_fresh_ip() {
        let alloc = Allocator::new("10.107.0.0/16");

        let first = alloc.allocate_ip_for_port("a.example", 443).unwrap();
        alloc.release_ip("a.example");
        let second = alloc.allocate_ip_for_port("a.example", 443).unwrap();

        // The cursor never moves backwards inside one process lifetime.
        assert_ne!(first, second);
    }

    #[test]
    fn exhaustion_is_reported() {
        // A /30 holds network, gateway, .2 and .3: two assignable addresses.
        let alloc = Allocator::new("10.107.0.0/30");

        alloc.allocate_ip_for_port("a.example", 1).unwrap();
        alloc.allocate_ip_for_port("b.example", 2).unwrap();

        match alloc.allocate_ip_for_port("c.example", 3) {
            Err(AllocError::Exhausted(subnet)) => assert_eq!(subnet, "10.107.0.0/30"),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn load_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ip_mappings.json");

        let alloc = Allocator::new("10.107.0.0/16");
        alloc.allocate_ip_for_port("a.example", 443).unwrap();
        alloc.allocate_ip_for_port("b.example", 5432).unwrap();
        alloc.save(&path).unwrap();

        let restored = Allocator::new("10.107.0.0/16");
        restored.load(&path).unwrap();

        assert_eq!(restored.all_mappings(), alloc.all_mappings());
    }

    #[test]
    fn restart_preserves_assignments_and_cursor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ip_mappings.json");

        let alloc = Allocator::new("10.107.0.0/16");
        alloc.allocate_ip_for_port("a.example", 443).unwrap();
        alloc.allocate_ip_for_port("b.example", 5432).unwrap();
        alloc.save(&path).unwrap();

        let restored = Allocator::new("10.107.0.0/16");
        restored.load(&path).unwrap();

        // Existing hostnames get their old addresses back.
        assert_eq!(
            restored.allocate_ip_for_port("a.example", 443).unwrap(),
            "10.107.0.2".parse::<Ipv4Addr>().unwrap()
        );
        // A new hostname lands past the largest persisted address.
        assert_eq!(
            restored.allocate_ip_for_port("c.example", 80).unwrap(),
            "10.107.0.4".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn missing_mappings_file_is_fine() {
        let dir = TempDir::new().unwrap();
        let alloc = Allocator::new("10.107.0.0/16");
        alloc.load(&dir.path().join("absent.json")).unwrap();
        assert!(alloc.all_mappings().is_empty());
    }

    #[test]
    fn parse_hostname_with_explicit_port() {
        assert_eq!(
            parse_hostname("tcp://my-service.namespace:5432").unwrap(),
            ("my-service.namespace".to_string(), 5432)
        );
        assert_eq!(
            parse_hostname("https://api.company:443").unwrap(),
            ("api.company".to_string(), 443)
        );
    }

    #[test]
    fn parse_hostname_scheme_defaults() {
        assert_eq!(
            parse_hostname("https://service").unwrap(),
            ("service".to_string(), 443)
        );
        assert_eq!(
            parse_hostname("http://service").unwrap(),
            ("service".to_string(), 80)
        );
        assert_eq!(
            parse_hostname("tcp-with-tls://service").unwrap(),
            ("service".to_string(), 443)
        );
    }

    #[test]
    fn parse_hostname_rejects_garbage() {
        assert!(parse_hostname("no-scheme-here").is_err());
        assert!(parse_hostname("tcp://service").is_err());
    }
}
