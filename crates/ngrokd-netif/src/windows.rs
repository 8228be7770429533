//! Windows implementation: loopback aliases via netsh.
//!
//! No virtual link is created; addresses are aliased onto the loopback
//! pseudo-interface on demand.

use crate::{command, Config, NetifError, NetworkInterface};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use tracing::{debug, info};

const LOOPBACK_INTERFACE: &str = "Loopback Pseudo-Interface 1";

pub(crate) struct WindowsInterface {
    name: String,
}

impl WindowsInterface {
    pub(crate) fn new(config: Config) -> Self {
        Self { name: config.name }
    }
}

#[async_trait]
impl NetworkInterface for WindowsInterface {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn create(&self, subnet: &str) -> Result<(), NetifError> {
        info!(subnet, "using loopback aliases (Windows)");
        Ok(())
    }

    async fn destroy(&self) -> Result<(), NetifError> {
        Ok(())
    }

    async fn add_ip(&self, ip: Ipv4Addr) -> Result<(), NetifError> {
        let addr = ip.to_string();
        command::run_idempotent(
            "netsh",
            &[
                "interface",
                "ipv4",
                "add",
                "address",
                LOOPBACK_INTERFACE,
                &addr,
                "255.255.255.255",
            ],
            &["already exists", "Element already exists"],
        )
        .await?;

        info!(ip = %ip, "aliased IP onto loopback");
        Ok(())
    }

    async fn remove_ip(&self, ip: Ipv4Addr) -> Result<(), NetifError> {
        let addr = ip.to_string();
        if let Err(e) = command::run(
            "netsh",
            &[
                "interface",
                "ipv4",
                "delete",
                "address",
                LOOPBACK_INTERFACE,
                &addr,
            ],
        )
        .await
        {
            debug!(ip = %ip, error = %e, "failed to remove loopback alias");
        }
        Ok(())
    }
}
