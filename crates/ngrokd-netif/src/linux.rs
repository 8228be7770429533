//! Linux implementation: a dummy link carrying the subnet.
//!
//! A dummy link (rather than tun/tap) is enough here: the daemon only needs
//! the addresses to exist locally so listeners can bind them, no packet
//! handling is involved.

use crate::{command, gateway_ip, parse_subnet, Config, NetifError, NetworkInterface};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tracing::{debug, info};

pub(crate) struct LinuxInterface {
    name: String,
    subnet: Mutex<String>,
}

impl LinuxInterface {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            name: config.name,
            subnet: Mutex::new(config.subnet),
        }
    }

    fn prefix_len(&self) -> Result<u8, NetifError> {
        let subnet = self.subnet.lock().unwrap().clone();
        Ok(parse_subnet(&subnet)?.prefix_len())
    }

    async fn link_exists(&self) -> bool {
        command::run("ip", &["link", "show", "dev", &self.name])
            .await
            .is_ok()
    }
}

#[async_trait]
impl NetworkInterface for LinuxInterface {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn create(&self, subnet: &str) -> Result<(), NetifError> {
        info!(name = %self.name, subnet, "creating virtual network interface");

        let net = parse_subnet(subnet)?;
        *self.subnet.lock().unwrap() = subnet.to_string();

        if self.link_exists().await {
            info!(name = %self.name, "interface already exists, reusing");
            command::run("ip", &["link", "set", "dev", &self.name, "up"]).await?;
            return Ok(());
        }

        command::run("ip", &["link", "add", &self.name, "type", "dummy"]).await?;

        let gateway = format!("{}/{}", gateway_ip(&net), net.prefix_len());
        command::run_idempotent(
            "ip",
            &["addr", "add", &gateway, "dev", &self.name],
            &["File exists"],
        )
        .await?;

        command::run("ip", &["link", "set", "dev", &self.name, "up"]).await?;

        info!(name = %self.name, subnet, gateway, "virtual network interface created");
        Ok(())
    }

    async fn destroy(&self) -> Result<(), NetifError> {
        info!(name = %self.name, "destroying virtual network interface");
        if !self.link_exists().await {
            return Ok(());
        }
        command::run("ip", &["link", "del", "dev", &self.name]).await?;
        Ok(())
    }

    async fn add_ip(&self, ip: Ipv4Addr) -> Result<(), NetifError> {
        if !self.link_exists().await {
            return Err(NetifError::NotCreated);
        }

        let addr = format!("{}/{}", ip, self.prefix_len()?);
        command::run_idempotent(
            "ip",
            &["addr", "add", &addr, "dev", &self.name],
            &["File exists"],
        )
        .await?;

        debug!(ip = %ip, interface = %self.name, "added IP to interface");
        Ok(())
    }

    async fn remove_ip(&self, ip: Ipv4Addr) -> Result<(), NetifError> {
        if !self.link_exists().await {
            return Err(NetifError::NotCreated);
        }

        let addr = format!("{}/{}", ip, self.prefix_len()?);
        command::run("ip", &["addr", "del", &addr, "dev", &self.name]).await?;

        debug!(ip = %ip, interface = %self.name, "removed IP from interface");
        Ok(())
    }
}
