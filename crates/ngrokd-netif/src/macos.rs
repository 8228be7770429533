//! macOS implementation: a utun device for the subnet route, lo0 aliases
//! for the individual addresses.
//!
//! Binding happens on lo0, not on the utun: each allocated address gets a
//! `/32` alias whose host route outranks the utun subnet route, so local
//! connections reach the listener instead of the tunnel.

use crate::{command, gateway_ip, parse_subnet, Config, NetifError, NetworkInterface};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const UTUN_CONTROL_NAME: &str = "com.apple.net.utun_control";

pub(crate) struct MacosInterface {
    name: String,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    subnet: String,
    utun_name: Option<String>,
    // Keeps the control socket open; closing it tears the utun down.
    utun_fd: Option<OwnedFd>,
}

impl MacosInterface {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            name: config.name,
            state: Mutex::new(State {
                subnet: config.subnet,
                utun_name: None,
                utun_fd: None,
            }),
        }
    }

    /// Open a utun control socket and connect it to the first free unit.
    fn create_utun() -> Result<(OwnedFd, String), NetifError> {
        // SAFETY: plain syscalls on a freshly created fd; ctl_info is a
        // fixed-layout struct zeroed before use.
        unsafe {
            let fd = libc::socket(libc::AF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL);
            if fd < 0 {
                return Err(NetifError::Utun(format!(
                    "control socket: {}",
                    std::io::Error::last_os_error()
                )));
            }
            let fd = OwnedFd::from_raw_fd(fd);

            let mut info: libc::ctl_info = std::mem::zeroed();
            for (dst, src) in info
                .ctl_name
                .iter_mut()
                .zip(UTUN_CONTROL_NAME.as_bytes().iter())
            {
                *dst = *src as libc::c_char;
            }

            if libc::ioctl(
                std::os::fd::AsRawFd::as_raw_fd(&fd),
                libc::CTLIOCGINFO,
                &mut info as *mut libc::ctl_info,
            ) < 0
            {
                return Err(NetifError::Utun(format!(
                    "CTLIOCGINFO: {}",
                    std::io::Error::last_os_error()
                )));
            }

            let mut last_err = std::io::Error::from_raw_os_error(libc::EBUSY);
            for unit in 1..=100u32 {
                let mut addr: libc::sockaddr_ctl = std::mem::zeroed();
                addr.sc_len = std::mem::size_of::<libc::sockaddr_ctl>() as u8;
                addr.sc_family = libc::AF_SYSTEM as u8;
                addr.ss_sysaddr = libc::AF_SYS_CONTROL as u16;
                addr.sc_id = info.ctl_id;
                addr.sc_unit = unit;

                let rc = libc::connect(
                    std::os::fd::AsRawFd::as_raw_fd(&fd),
                    &addr as *const libc::sockaddr_ctl as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_ctl>() as libc::socklen_t,
                );
                if rc == 0 {
                    // Unit N shows up as utun(N-1)
                    return Ok((fd, format!("utun{}", unit - 1)));
                }
                last_err = std::io::Error::last_os_error();
            }

            Err(NetifError::Utun(format!(
                "no free utun unit in 1..=100: {last_err}"
            )))
        }
    }

    async fn create_loopback_alias(&self, net: &ipnet::Ipv4Net) -> Result<(), NetifError> {
        info!("using loopback aliases (utun fallback)");
        let gateway = gateway_ip(net).to_string();
        let mask = net.netmask().to_string();
        if let Err(e) = command::run("ifconfig", &["lo0", "alias", &gateway, "netmask", &mask]).await
        {
            warn!(error = %e, "failed to create loopback alias (may need sudo)");
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkInterface for MacosInterface {
    fn name(&self) -> String {
        let state = self.state.lock().unwrap();
        state.utun_name.clone().unwrap_or_else(|| self.name.clone())
    }

    async fn create(&self, subnet: &str) -> Result<(), NetifError> {
        info!(name = %self.name, requested_subnet = subnet, "creating virtual network interface (macOS)");

        let net = parse_subnet(subnet)?;

        let (fd, utun_name) = match Self::create_utun() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "failed to create utun interface, falling back to loopback aliases");
                return self.create_loopback_alias(&net).await;
            }
        };
        info!(interface = %utun_name, "created utun interface");

        let gateway = gateway_ip(&net).to_string();
        let peer = Ipv4Addr::from(u32::from(net.network()) + 2).to_string();
        let mask = net.netmask().to_string();

        if let Err(e) = command::run(
            "ifconfig",
            &[&utun_name, "inet", &gateway, &peer, "netmask", &mask, "up"],
        )
        .await
        {
            return Err(NetifError::Utun(format!("configure {utun_name}: {e}")));
        }

        // Subnet route through the tunnel; individual /32 lo0 aliases added
        // later will still win the route lookup.
        if let Err(e) = command::run("route", &["add", "-net", subnet, "-interface", &utun_name]).await
        {
            debug!(error = %e, "route may already exist");
        }

        let mut state = self.state.lock().unwrap();
        state.subnet = subnet.to_string();
        state.utun_name = Some(utun_name);
        state.utun_fd = Some(fd);

        Ok(())
    }

    async fn destroy(&self) -> Result<(), NetifError> {
        let (subnet, had_utun) = {
            let mut state = self.state.lock().unwrap();
            let had_utun = state.utun_fd.take().is_some();
            state.utun_name = None;
            (state.subnet.clone(), had_utun)
        };

        if had_utun && !subnet.is_empty() {
            if let Err(e) = command::run("route", &["delete", "-net", &subnet]).await {
                debug!(error = %e, "failed to remove route");
            }
            return Ok(());
        }

        // Fallback mode: drop the gateway alias from lo0.
        if let Ok(net) = parse_subnet(&subnet) {
            let gateway = gateway_ip(&net).to_string();
            if let Err(e) = command::run("ifconfig", &["lo0", "-alias", &gateway]).await {
                debug!(error = %e, "failed to remove loopback alias");
            }
        }
        Ok(())
    }

    async fn add_ip(&self, ip: Ipv4Addr) -> Result<(), NetifError> {
        let addr = ip.to_string();
        command::run("ifconfig", &["lo0", "alias", &addr, "255.255.255.255"]).await?;
        info!(ip = %ip, "added IP to loopback (/32 host route)");
        Ok(())
    }

    async fn remove_ip(&self, ip: Ipv4Addr) -> Result<(), NetifError> {
        let addr = ip.to_string();
        if let Err(e) = command::run("ifconfig", &["lo0", "-alias", &addr]).await {
            debug!(ip = %ip, error = %e, "failed to remove IP from lo0");
        }
        Ok(())
    }
}
