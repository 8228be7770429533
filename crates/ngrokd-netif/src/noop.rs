//! Recording no-op interface, used on unsupported platforms and in tests.

use crate::{NetifError, NetworkInterface};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// An interface that records mutations without touching the host.
#[derive(Default)]
pub struct NoopInterface {
    name: String,
    ips: Mutex<Vec<Ipv4Addr>>,
}

impl NoopInterface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ips: Mutex::new(Vec::new()),
        }
    }

    /// Addresses currently attached, in insertion order.
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.ips.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkInterface for NoopInterface {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn create(&self, _subnet: &str) -> Result<(), NetifError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), NetifError> {
        self.ips.lock().unwrap().clear();
        Ok(())
    }

    async fn add_ip(&self, ip: Ipv4Addr) -> Result<(), NetifError> {
        let mut ips = self.ips.lock().unwrap();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
        Ok(())
    }

    async fn remove_ip(&self, ip: Ipv4Addr) -> Result<(), NetifError> {
        self.ips.lock().unwrap().retain(|known| *known != ip);
        Ok(())
    }
}
