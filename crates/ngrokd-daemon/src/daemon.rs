//! The reconciler: owns every subsystem and converges local listener state
//! toward the remote inventory.
//!
//! All state mutation happens here, under one write lock: the poll tick,
//! API-key registration, and hot-reload rebinding. Status surfaces read
//! through the same lock and observe consistent snapshots.

use crate::config::DaemonConfig;
use crate::health::{self, HealthState};
use crate::hosts;
use crate::ipalloc::{parse_hostname, Allocator};
use crate::resolver;
use crate::socket::{self, DaemonController, EndpointInfo, StatusResponse};
use crate::watcher;
use crate::DaemonError;
use async_trait::async_trait;
use ngrokd_cert::Provisioner;
use ngrokd_forward::{BoundEndpoint, Forwarder, ForwarderConfig, ListenerManager};
use ngrokd_netif::{new_interface, NetworkInterface};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

struct State {
    registered: bool,
    operator_id: String,
    endpoints: HashMap<String, EndpointInfo>,
    next_port: u16,
    network_ports: HashMap<String, u16>,
}

/// The ngrokd daemon.
pub struct Daemon {
    // Self-handle for spawning the poll loop from trait methods.
    me: Weak<Daemon>,
    config: RwLock<DaemonConfig>,
    config_path: PathBuf,
    state: RwLock<State>,
    allocator: Allocator,
    hosts: hosts::Manager,
    netif: Arc<dyn NetworkInterface>,
    health: Arc<HealthState>,
    listeners: RwLock<Option<Arc<ListenerManager>>>,
}

impl Daemon {
    /// Load configuration and assemble the daemon with the platform
    /// interface and the system hosts file.
    pub fn new(config_path: &Path) -> Result<Arc<Self>, DaemonError> {
        let config = DaemonConfig::load(config_path).map_err(DaemonError::Config)?;
        let netif: Arc<dyn NetworkInterface> = Arc::from(new_interface(ngrokd_netif::Config {
            name: config.net.interface_name.clone(),
            subnet: config.net.subnet.clone(),
        }));
        Self::with_components(config_path, config, netif, hosts::Manager::new())
    }

    /// Assemble the daemon with injected host-integration components.
    pub fn with_components(
        config_path: &Path,
        config: DaemonConfig,
        netif: Arc<dyn NetworkInterface>,
        hosts: hosts::Manager,
    ) -> Result<Arc<Self>, DaemonError> {
        // macOS routes the configured subnet through a utun device; only
        // loopback-range addresses can carry the /32 alias that beats the
        // utun route, so the allocator draws from 127.0.0.0/8 there.
        let allocator_subnet = if cfg!(target_os = "macos") {
            info!("using 127.0.0.0/8 subnet for macOS compatibility");
            "127.0.0.0/8".to_string()
        } else {
            config.net.subnet.clone()
        };

        let mut state = State {
            registered: false,
            operator_id: String::new(),
            endpoints: HashMap::new(),
            next_port: config.net.start_port,
            network_ports: HashMap::new(),
        };

        if let Some(operator_id) = ngrokd_cert::load_operator_id(&config.cert_dir()) {
            info!(operator_id = %operator_id, "found existing registration");
            state.operator_id = operator_id;
            state.registered = true;
        }

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            allocator: Allocator::new(&allocator_subnet),
            config: RwLock::new(config),
            config_path: config_path.to_path_buf(),
            state: RwLock::new(state),
            hosts,
            netif,
            health: HealthState::new(),
            listeners: RwLock::new(None),
        }))
    }

    /// Run the daemon until interrupted.
    pub async fn run(self: &Arc<Self>) -> Result<(), DaemonError> {
        info!("starting ngrokd daemon");

        let (subnet, socket_path, api_key_present) = {
            let config = self.config.read().await;
            (
                config.net.subnet.clone(),
                config.server.socket_path.clone(),
                !config.api.key.is_empty(),
            )
        };

        // Listeners on loopback may still work when this fails, so startup
        // continues.
        if let Err(e) = self.netif.create(&subnet).await {
            error!(error = %e, "failed to create virtual network interface - continuing");
        }

        self.load_persistent_state().await;

        let controller: Arc<dyn DaemonController> = self.clone();
        let socket_server = socket::Server::new(&socket_path, controller);
        socket_server.start()?;

        tokio::spawn(health::serve(
            self.health.clone(),
            health::DEFAULT_HEALTH_ADDR.parse().expect("static address"),
        ));

        let registered = self.state.read().await.registered;
        if !registered {
            if api_key_present {
                self.register().await?;
            } else {
                info!("not registered and no API key provided");
                info!("waiting for API key via: ngrokctl set-api-key <KEY>");
                info!(path = %socket_path, "control socket listening");
            }
        }

        if self.state.read().await.registered {
            self.init_forwarder().await?;
            self.health.set_ready(true);
            tokio::spawn(self.clone().poll_loop());
        }

        watcher::spawn(self.clone(), self.config_path.clone());

        info!("daemon started successfully");
        tokio::signal::ctrl_c().await?;
        info!("shutting down");

        if let Some(listeners) = self.listeners.read().await.as_ref() {
            listeners.close().await;
        }
        drop(socket_server);
        Ok(())
    }

    async fn register(&self) -> Result<(), DaemonError> {
        info!("registering with ngrok API");

        let cert_config = {
            let config = self.config.read().await;
            ngrokd_cert::Config {
                cert_dir: config.cert_dir(),
                api_url: config.api.url.clone(),
                api_key: config.api.key.clone(),
                description: "ngrokd daemon".to_string(),
                metadata: String::new(),
                region: "global".to_string(),
            }
        };
        std::fs::create_dir_all(&cert_config.cert_dir)?;

        let mut manager = ngrokd_cert::Manager::new(&cert_config);
        manager.ensure_certificate(&cert_config).await?;

        let mut state = self.state.write().await;
        state.operator_id = manager.operator_id().to_string();
        state.registered = true;
        info!(operator_id = %state.operator_id, "registration complete");
        Ok(())
    }

    /// (Re)build the forwarder and listener manager from the on-disk
    /// client credential.
    pub async fn init_forwarder(&self) -> Result<(), DaemonError> {
        let (cert_path, key_path, ingress_endpoint) = {
            let config = self.config.read().await;
            (
                config.server.client_cert.clone(),
                config.server.client_key.clone(),
                config.ingress_endpoint.clone(),
            )
        };

        let cert_pem = std::fs::read(&cert_path)?;
        let key_pem = std::fs::read(&key_path)?;
        let identity = Provisioner::parse_identity(&cert_pem, &key_pem)
            .map_err(DaemonError::Registration)?;

        let mut forwarder_config = ForwarderConfig::new(identity);
        forwarder_config.ingress_endpoint = ingress_endpoint;
        let forwarder = Arc::new(Forwarder::new(forwarder_config)?);

        let manager = Arc::new(ListenerManager::new(forwarder, self.health.clone()));
        *self.listeners.write().await = Some(manager);
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>) {
        let interval = self.config.read().await.bound_endpoints.poll_interval;
        info!(interval_seconds = interval, "starting polling loop");

        // Poll immediately on startup, then on the (hot-reloadable) interval.
        self.poll_and_reconcile().await;
        loop {
            let interval = self.config.read().await.bound_endpoints.poll_interval;
            tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
            self.poll_and_reconcile().await;
        }
    }

    async fn poll_and_reconcile(&self) {
        debug!("polling for bound endpoints");

        let (api_url, api_key) = {
            let config = self.config.read().await;
            (config.api.url.clone(), config.api.key.clone())
        };
        let operator_id = self.state.read().await.operator_id.clone();

        let client = ngrokd_api::Client::with_base_url(api_url, api_key);
        let api_endpoints = match client.list_bound_endpoints(&operator_id).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(error = %e, "failed to fetch bound endpoints");
                return;
            }
        };

        debug!(count = api_endpoints.len(), "found bound endpoints");
        self.reconcile(api_endpoints).await;
    }

    /// Converge local state toward one polled inventory.
    pub async fn reconcile(&self, api_endpoints: Vec<ngrokd_api::Endpoint>) {
        let desired: HashMap<String, ngrokd_api::Endpoint> = api_endpoints
            .into_iter()
            .map(|ep| (ep.id.clone(), ep))
            .collect();

        {
            let mut state = self.state.write().await;

            let removed: Vec<String> = state
                .endpoints
                .keys()
                .filter(|id| !desired.contains_key(*id))
                .cloned()
                .collect();
            for id in removed {
                self.remove_endpoint(&mut state, &id).await;
            }

            // Deterministic order keeps IP assignment stable for a given
            // inventory.
            let mut added: Vec<&ngrokd_api::Endpoint> = desired
                .values()
                .filter(|ep| !state.endpoints.contains_key(&ep.id))
                .collect();
            added.sort_by(|a, b| a.id.cmp(&b.id));
            for ep in added {
                self.add_endpoint(&mut state, ep).await;
            }
        }

        self.update_hosts();

        if let Err(e) = self.allocator.save(&self.ip_mappings_path().await) {
            warn!(error = %e, "failed to save IP mappings");
        }
        if let Err(e) = self.save_network_ports().await {
            warn!(error = %e, "failed to save network port mappings");
        }
    }

    async fn add_endpoint(&self, state: &mut State, ep: &ngrokd_api::Endpoint) {
        let (hostname, port) = match parse_hostname(&ep.url) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(url = %ep.url, error = %e, "failed to parse endpoint");
                return;
            }
        };

        let ip = match self.allocator.allocate_ip_for_port(&hostname, port) {
            Ok(ip) => ip,
            Err(e) => {
                error!(hostname = %hostname, port, error = %e, "failed to allocate IP");
                return;
            }
        };

        if let Err(e) = self.netif.add_ip(ip).await {
            // The listener may still work without the interface address.
            error!(ip = %ip, error = %e, "failed to add IP to interface");
        }

        let listen_spec = {
            let config = self.config.read().await;
            let spec = config.listen_interface_for(&hostname);
            if config.net.overrides.contains_key(&hostname) {
                info!(hostname = %hostname, listen_interface = %spec, "using endpoint override");
            }
            spec
        };

        let listen_interface = match resolver::resolve_interface_to_ip(&listen_spec) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(
                    endpoint = %ep.url,
                    hostname = %hostname,
                    listen_interface = %listen_spec,
                    error = %e,
                    available_interfaces = ?resolver::list_available_interfaces(),
                    "failed to resolve listen_interface"
                );
                return;
            }
        };

        if listen_interface != "virtual"
            && listen_interface != "0.0.0.0"
            && !resolver::ip_exists_on_machine(&listen_interface)
        {
            error!(
                endpoint = %ep.url,
                hostname = %hostname,
                listen_interface = %listen_interface,
                available_interfaces = ?resolver::list_available_interfaces(),
                "listen_interface IP does not exist on this machine"
            );
            return;
        }

        let virtual_mode = listen_interface == "virtual";
        let (listen_addr, listen_port) = if virtual_mode {
            (ip.to_string(), port)
        } else {
            let listen_port = match state.network_ports.get(&hostname) {
                Some(existing) => {
                    debug!(hostname = %hostname, port = existing, "reusing network port");
                    *existing
                }
                None => {
                    let allocated = state.next_port;
                    state.network_ports.insert(hostname.clone(), allocated);
                    state.next_port += 1;
                    info!(hostname = %hostname, port = allocated, "allocated network port");
                    allocated
                }
            };
            (listen_interface.clone(), listen_port)
        };

        let endpoint = BoundEndpoint {
            name: ep.id.clone(),
            uri: ep.url.clone(),
            port,
            local_port: listen_port,
            local_address: listen_addr.clone(),
        };

        let manager = self.listeners.read().await.clone();
        let Some(manager) = manager else {
            error!(endpoint = %ep.url, "listener manager not initialised");
            return;
        };

        if let Err(e) = manager.start_listener(endpoint).await {
            error!(
                endpoint = %ep.url,
                address = %listen_addr,
                port = listen_port,
                error = %e,
                "failed to start listener"
            );
            // Visible on the status surface, absent from the live map: the
            // next tick retries the bind.
            self.health
                .register_endpoint(&ep.id, &format!("{listen_addr}:{listen_port}"), &ep.url, false);
            return;
        }

        info!(
            endpoint = %ep.url,
            address = %format!("{listen_addr}:{listen_port}"),
            mode = if virtual_mode { "virtual" } else { "network" },
            "started listener"
        );

        self.health
            .register_endpoint(&ep.id, &format!("{ip}:{port}"), &ep.url, true);

        state.endpoints.insert(
            ep.id.clone(),
            EndpointInfo {
                id: ep.id.clone(),
                hostname: hostname.clone(),
                ip: ip.to_string(),
                port,
                url: ep.url.clone(),
                local_listener: true,
                network_port: if virtual_mode { 0 } else { listen_port },
                listen_interface,
            },
        );

        info!(hostname = %hostname, ip = %ip, port, url = %ep.url, "added bound endpoint");
    }

    async fn remove_endpoint(&self, state: &mut State, id: &str) {
        let Some(ep) = state.endpoints.remove(id) else {
            return;
        };

        if let Some(manager) = self.listeners.read().await.as_ref() {
            if let Err(e) = manager.stop_listener(id).await {
                debug!(endpoint = %id, error = %e, "listener already gone");
            }
        }

        if let Ok(ip) = ep.ip.parse::<Ipv4Addr>() {
            if let Err(e) = self.netif.remove_ip(ip).await {
                error!(ip = %ep.ip, error = %e, "failed to remove IP from interface");
            }
        }

        self.allocator.release_ip(&ep.hostname);
        self.health.unregister_endpoint(id);

        info!(hostname = %ep.hostname, ip = %ep.ip, "removed bound endpoint");
    }

    fn update_hosts(&self) {
        let mappings = self.allocator.all_mappings();
        if let Err(e) = self.hosts.update_hosts(&mappings) {
            error!(error = %e, "failed to update hosts file");
        }
    }

    /// Re-read the config file and apply the hot-reloadable subset.
    pub async fn reload_config(&self) {
        let new_config = match DaemonConfig::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "invalid config - reload failed, keeping current configuration");
                return;
            }
        };
        if let Err(e) = new_config.validate() {
            error!(error = %e, "config validation failed - reload aborted, fix errors and save again");
            return;
        }

        let (old_overrides, old_default) = {
            let mut config = self.config.write().await;

            let old_poll = config.bound_endpoints.poll_interval;
            let old_overrides = config.net.overrides.clone();
            let old_default = config.net.listen_interface.clone();

            config.bound_endpoints.poll_interval = new_config.bound_endpoints.poll_interval;
            config.net.overrides = new_config.net.overrides.clone();
            config.net.listen_interface = new_config.net.listen_interface.clone();
            config.net.start_port = new_config.net.start_port;

            if old_poll != config.bound_endpoints.poll_interval {
                info!(
                    old = old_poll,
                    new = config.bound_endpoints.poll_interval,
                    "poll interval updated"
                );
            }

            (old_overrides, old_default)
        };

        let overrides_changed = old_overrides != new_config.net.overrides;
        let default_changed = old_default != new_config.net.listen_interface;

        if overrides_changed || default_changed {
            info!("listen interface configuration changed, rebinding affected endpoints (active connections will drop)");

            let to_rebind: Vec<String> = {
                let state = self.state.read().await;
                state
                    .endpoints
                    .values()
                    .filter(|ep| {
                        let old_spec = old_overrides
                            .get(&ep.hostname)
                            .cloned()
                            .unwrap_or_else(|| old_default.clone());
                        let new_spec = new_config
                            .net
                            .overrides
                            .get(&ep.hostname)
                            .cloned()
                            .unwrap_or_else(|| new_config.net.listen_interface.clone());
                        if old_spec != new_spec {
                            info!(
                                hostname = %ep.hostname,
                                old_interface = %old_spec,
                                new_interface = %new_spec,
                                "endpoint needs rebinding"
                            );
                        }
                        old_spec != new_spec
                    })
                    .map(|ep| ep.id.clone())
                    .collect()
            };

            if !to_rebind.is_empty() {
                let count = to_rebind.len();
                self.rebind_endpoints(to_rebind).await;
                info!(count, "rebinding complete");
            }
        }

        info!("config reloaded successfully");
    }

    async fn rebind_endpoints(&self, endpoint_ids: Vec<String>) {
        let mut state = self.state.write().await;

        let mut to_recreate = Vec::new();
        for id in endpoint_ids {
            let Some(ep) = state.endpoints.remove(&id) else {
                continue;
            };

            if let Some(manager) = self.listeners.read().await.as_ref() {
                if let Err(e) = manager.stop_listener(&id).await {
                    debug!(endpoint = %id, error = %e, "listener already gone");
                }
            }
            self.health.unregister_endpoint(&id);
            info!(endpoint = %ep.url, "stopped listener for rebinding");

            to_recreate.push(ngrokd_api::Endpoint {
                id: ep.id,
                url: ep.url,
                ..Default::default()
            });
        }

        for ep in to_recreate {
            info!(endpoint = %ep.url, "recreating listener with new config");
            self.add_endpoint(&mut state, &ep).await;
        }
    }

    /// Read the persisted hostname→IP and hostname→port maps back in.
    /// Missing or unreadable files leave the in-memory state untouched.
    pub async fn load_persistent_state(&self) {
        if let Err(e) = self.allocator.load(&self.ip_mappings_path().await) {
            info!(error = %e, "could not load persistent IP mappings");
        }
        if let Err(e) = self.load_network_ports().await {
            info!(error = %e, "could not load persistent network port mappings");
        }
    }

    async fn ip_mappings_path(&self) -> PathBuf {
        self.config.read().await.cert_dir().join("ip_mappings.json")
    }

    async fn network_ports_path(&self) -> PathBuf {
        self.config
            .read()
            .await
            .cert_dir()
            .join("network_ports.json")
    }

    async fn load_network_ports(&self) -> Result<(), DaemonError> {
        let path = self.network_ports_path().await;
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mappings: HashMap<String, u16> = serde_json::from_str(&data)
            .map_err(|e| DaemonError::Config(format!("bad network_ports.json: {e}")))?;

        let mut state = self.state.write().await;
        let start_port = self.config.read().await.net.start_port;
        state.next_port = match mappings.values().copied().max() {
            Some(max_port) => max_port.saturating_add(1).max(start_port),
            None => start_port,
        };
        let count = mappings.len();
        state.network_ports = mappings;

        info!(count, "loaded persistent network port mappings");
        Ok(())
    }

    async fn save_network_ports(&self) -> Result<(), DaemonError> {
        let path = self.network_ports_path().await;
        let mappings = self.state.read().await.network_ports.clone();

        let data = serde_json::to_string_pretty(&mappings)
            .map_err(|e| DaemonError::Config(format!("serialize network ports: {e}")))?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

#[async_trait]
impl DaemonController for Daemon {
    async fn status(&self) -> StatusResponse {
        let state = self.state.read().await;
        let config = self.config.read().await;
        StatusResponse {
            registered: state.registered,
            operator_id: state.operator_id.clone(),
            endpoint_count: state.endpoints.len(),
            ingress_endpoint: config.ingress_endpoint.clone(),
        }
    }

    async fn list_endpoints(&self) -> Vec<EndpointInfo> {
        let state = self.state.read().await;
        state.endpoints.values().cloned().collect()
    }

    async fn set_api_key(&self, key: String) -> Result<(), String> {
        {
            let mut config = self.config.write().await;
            config.api.key = key.clone();
        }

        DaemonConfig::save_api_key(&self.config_path, &key)
            .map_err(|e| format!("failed to save API key to config: {e}"))?;
        info!(path = %self.config_path.display(), "API key saved to config file");

        let registered = self.state.read().await.registered;
        if !registered {
            self.register()
                .await
                .map_err(|e| format!("registration failed: {e}"))?;
            self.init_forwarder()
                .await
                .map_err(|e| format!("failed to initialize forwarder: {e}"))?;
            self.health.set_ready(true);

            if let Some(this) = self.me.upgrade() {
                tokio::spawn(this.poll_loop());
            }
        }

        Ok(())
    }
}
