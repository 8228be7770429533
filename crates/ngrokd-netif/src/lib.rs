//! Virtual network interface management.
//!
//! Allocated per-hostname IPs must be bindable on the local machine. How
//! that happens differs per platform: Linux gets a dummy link carrying the
//! whole subnet, macOS routes the subnet through a utun device but aliases
//! each address onto lo0 as a /32 host route (the host route outranks the
//! utun subnet route, which is what makes the local bind win), and Windows
//! aliases addresses straight onto the loopback pseudo-interface.
//!
//! Interface errors are reported to the caller but are not fatal to
//! reconciliation: a listener bound to 127.0.0.1 can still work when
//! interface setup fails.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use thiserror::Error;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;

mod command;
mod noop;

pub use noop::NoopInterface;

#[derive(Debug, Error)]
pub enum NetifError {
    #[error("invalid subnet {subnet}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("interface not created")]
    NotCreated,

    #[error("{command} failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("utun control socket: {0}")]
    Utun(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Capability for managing the virtual interface and its addresses.
#[async_trait]
pub trait NetworkInterface: Send + Sync {
    /// Interface name as visible to the host (e.g. `ngrokd0`, `utun4`).
    fn name(&self) -> String;

    /// Create (or reuse) the interface and attach the subnet.
    async fn create(&self, subnet: &str) -> Result<(), NetifError>;

    /// Tear the interface down.
    async fn destroy(&self) -> Result<(), NetifError>;

    /// Make `ip` bindable on this host.
    async fn add_ip(&self, ip: Ipv4Addr) -> Result<(), NetifError>;

    /// Remove a previously added address.
    async fn remove_ip(&self, ip: Ipv4Addr) -> Result<(), NetifError>;
}

/// Interface configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub subnet: String,
}

/// Construct the platform interface implementation.
pub fn new_interface(config: Config) -> Box<dyn NetworkInterface> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxInterface::new(config))
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(macos::MacosInterface::new(config))
    }
    #[cfg(windows)]
    {
        Box::new(windows::WindowsInterface::new(config))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        Box::new(noop::NoopInterface::new(config.name))
    }
}

pub(crate) fn parse_subnet(subnet: &str) -> Result<ipnet::Ipv4Net, NetifError> {
    subnet
        .parse::<ipnet::Ipv4Net>()
        .map_err(|e| NetifError::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: e.to_string(),
        })
}

/// The conventional gateway address of a subnet (network + 1).
pub(crate) fn gateway_ip(net: &ipnet::Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(net.network()) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_is_network_plus_one() {
        let net: ipnet::Ipv4Net = "10.107.0.0/16".parse().unwrap();
        assert_eq!(gateway_ip(&net), "10.107.0.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn bad_subnet_is_reported() {
        match parse_subnet("not-a-subnet") {
            Err(NetifError::InvalidSubnet { subnet, .. }) => assert_eq!(subnet, "not-a-subnet"),
            other => panic!("expected InvalidSubnet, got {other:?}"),
        }
    }
}
