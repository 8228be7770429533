//! Reconciliation scenarios: cold start, endpoint removal, restart
//! stability, listen-interface overrides, and hot reload.
//!
//! Listeners bind real sockets, so the test subnet lives inside
//! 127.0.0.0/8 where every address is locally bindable without any
//! interface setup.

#![cfg(target_os = "linux")]

use ngrokd_daemon::config::DaemonConfig;
use ngrokd_daemon::daemon::Daemon;
use ngrokd_daemon::hosts;
use ngrokd_daemon::socket::DaemonController;
use ngrokd_netif::NoopInterface;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const TEST_SUBNET: &str = "127.107.0.0/16";

struct Harness {
    dir: TempDir,
    daemon: Arc<Daemon>,
    netif: Arc<NoopInterface>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self::with_dir(dir, &HashMap::new()).await
    }

    async fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let dir = TempDir::new().unwrap();
        Self::with_dir(dir, overrides).await
    }

    async fn with_dir(dir: TempDir, overrides: &HashMap<String, String>) -> Self {
        let config_path = dir.path().join("config.yml");
        if !config_path.exists() {
            write_config(&config_path, dir.path(), overrides);
        }
        write_identity(dir.path());
        std::fs::write(dir.path().join("hosts"), "127.0.0.1 localhost\n").unwrap();

        let config = DaemonConfig::load(&config_path).unwrap();
        let netif = Arc::new(NoopInterface::new("ngrokd0"));
        let daemon = Daemon::with_components(
            &config_path,
            config,
            netif.clone(),
            hosts::Manager::with_path(dir.path().join("hosts")),
        )
        .unwrap();
        daemon.init_forwarder().await.unwrap();

        Self { dir, daemon, netif }
    }

    /// Re-create the daemon over the same state directory, as a restart
    /// would.
    async fn restart(self) -> Self {
        let Harness { dir, daemon, .. } = self;
        drop(daemon);
        // The old daemon's listeners shut down asynchronously.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let harness = Self::with_dir(dir, &HashMap::new()).await;
        // Persisted mappings are read back exactly once, at startup.
        harness.daemon.load_persistent_state().await;
        harness
    }

    fn hosts_content(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("hosts")).unwrap()
    }

    fn ip_mappings(&self) -> HashMap<String, String> {
        let data = std::fs::read_to_string(self.dir.path().join("certs/ip_mappings.json")).unwrap();
        serde_json::from_str(&data).unwrap()
    }

    fn network_ports(&self) -> HashMap<String, u16> {
        let data =
            std::fs::read_to_string(self.dir.path().join("certs/network_ports.json")).unwrap();
        serde_json::from_str(&data).unwrap()
    }

    async fn endpoint_by_id(&self, id: &str) -> Option<ngrokd_daemon::socket::EndpointInfo> {
        self.daemon
            .list_endpoints()
            .await
            .into_iter()
            .find(|ep| ep.id == id)
    }
}

fn write_config(path: &Path, dir: &Path, overrides: &HashMap<String, String>) {
    let mut config = format!(
        concat!(
            "api:\n",
            "  key: test-key\n",
            "server:\n",
            "  socket_path: {socket}\n",
            "  client_cert: {cert}\n",
            "  client_key: {key}\n",
            "net:\n",
            "  subnet: {subnet}\n",
            "  listen_interface: virtual\n",
            "  start_port: 19080\n",
        ),
        socket = dir.join("ngrokd.sock").display(),
        cert = dir.join("certs/tls.crt").display(),
        key = dir.join("certs/tls.key").display(),
        subnet = TEST_SUBNET,
    );
    if !overrides.is_empty() {
        config.push_str("  overrides:\n");
        for (hostname, spec) in overrides {
            config.push_str(&format!("    {hostname}: \"{spec}\"\n"));
        }
    }
    std::fs::write(path, config).unwrap();
}

fn write_identity(dir: &Path) {
    let certs = dir.join("certs");
    std::fs::create_dir_all(&certs).unwrap();

    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
    let cert = rcgen::CertificateParams::default()
        .self_signed(&key_pair)
        .unwrap();

    std::fs::write(certs.join("tls.crt"), cert.pem()).unwrap();
    std::fs::write(certs.join("tls.key"), key_pair.serialize_pem()).unwrap();
}

fn endpoint(id: &str, url: &str) -> ngrokd_api::Endpoint {
    serde_json::from_value(serde_json::json!({ "id": id, "url": url })).unwrap()
}

async fn can_connect(addr: &str) -> bool {
    tokio::net::TcpStream::connect(addr).await.is_ok()
}

#[tokio::test]
async fn cold_start_materialises_two_endpoints() {
    let harness = Harness::new().await;

    harness
        .daemon
        .reconcile(vec![
            endpoint("e1", "https://a.example:18443"),
            endpoint("e2", "tcp://b.example:15432"),
        ])
        .await;

    // Allocation starts at .0.2 and advances per hostname.
    let mappings = harness.ip_mappings();
    assert_eq!(mappings["a.example"], "127.107.0.2");
    assert_eq!(mappings["b.example"], "127.107.0.3");

    // Virtual mode binds allocated_ip:remote_port.
    assert!(can_connect("127.107.0.2:18443").await);
    assert!(can_connect("127.107.0.3:15432").await);

    let e1 = harness.endpoint_by_id("e1").await.unwrap();
    assert!(e1.local_listener);
    assert_eq!(e1.listen_interface, "virtual");
    assert_eq!(e1.network_port, 0);

    // Both hostnames published in the managed hosts section.
    let hosts = harness.hosts_content();
    assert!(hosts.contains("127.107.0.2\ta.example"));
    assert!(hosts.contains("127.107.0.3\tb.example"));

    let status = harness.daemon.status().await;
    assert_eq!(status.endpoint_count, 2);
}

#[tokio::test]
async fn disappeared_endpoint_is_torn_down() {
    let harness = Harness::new().await;

    harness
        .daemon
        .reconcile(vec![
            endpoint("e1", "https://a.example:18444"),
            endpoint("e2", "tcp://b.example:15433"),
        ])
        .await;
    assert!(can_connect("127.107.0.3:15433").await);

    harness
        .daemon
        .reconcile(vec![endpoint("e1", "https://a.example:18444")])
        .await;

    // Listener gone, interface address released, hosts entry dropped,
    // allocation released.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!can_connect("127.107.0.3:15433").await);
    assert!(!harness
        .netif
        .addresses()
        .contains(&"127.107.0.3".parse().unwrap()));
    assert!(!harness.hosts_content().contains("b.example"));
    assert!(!harness.ip_mappings().contains_key("b.example"));

    assert!(harness.endpoint_by_id("e2").await.is_none());
    assert!(harness.endpoint_by_id("e1").await.is_some());
}

#[tokio::test]
async fn restart_preserves_ip_assignments() {
    let harness = Harness::new().await;

    harness
        .daemon
        .reconcile(vec![
            endpoint("e1", "https://a.example:18445"),
            endpoint("e2", "tcp://b.example:15434"),
        ])
        .await;
    let before = harness.ip_mappings();

    let harness = harness.restart().await;
    harness
        .daemon
        .reconcile(vec![
            endpoint("e1", "https://a.example:18445"),
            endpoint("e2", "tcp://b.example:15434"),
        ])
        .await;

    assert_eq!(harness.ip_mappings(), before);
}

#[tokio::test]
async fn override_switches_endpoint_to_network_mode() {
    let overrides = HashMap::from([("a.example".to_string(), "0.0.0.0".to_string())]);
    let harness = Harness::with_overrides(&overrides).await;

    harness
        .daemon
        .reconcile(vec![
            endpoint("e1", "https://a.example:18446"),
            endpoint("e2", "tcp://b.example:15435"),
        ])
        .await;

    // The overridden endpoint binds the first network port on 0.0.0.0 and
    // the assignment is persisted.
    let e1 = harness.endpoint_by_id("e1").await.unwrap();
    assert_eq!(e1.listen_interface, "0.0.0.0");
    assert_eq!(e1.network_port, 19080);
    assert!(can_connect("127.0.0.1:19080").await);
    assert_eq!(harness.network_ports()["a.example"], 19080);

    // The other endpoint stays in virtual mode.
    let e2 = harness.endpoint_by_id("e2").await.unwrap();
    assert_eq!(e2.listen_interface, "virtual");
    assert!(can_connect("127.107.0.3:15435").await);
}

#[tokio::test]
async fn hot_reload_rebinds_only_changed_endpoints() {
    let overrides = HashMap::from([("a.example".to_string(), "0.0.0.0".to_string())]);
    let harness = Harness::with_overrides(&overrides).await;

    harness
        .daemon
        .reconcile(vec![
            endpoint("e1", "https://a.example:18447"),
            endpoint("e2", "tcp://b.example:15436"),
        ])
        .await;
    assert!(can_connect("127.0.0.1:19080").await);

    // Drop the override from the config file and reload.
    write_config(
        &harness.dir.path().join("config.yml"),
        harness.dir.path(),
        &HashMap::new(),
    );
    harness.daemon.reload_config().await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // e1 is rebound into virtual mode on its allocated IP.
    let e1 = harness.endpoint_by_id("e1").await.unwrap();
    assert_eq!(e1.listen_interface, "virtual");
    assert!(can_connect("127.107.0.2:18447").await);
    assert!(!can_connect("127.0.0.1:19080").await);

    // e2 was untouched.
    let e2 = harness.endpoint_by_id("e2").await.unwrap();
    assert_eq!(e2.listen_interface, "virtual");
    assert!(can_connect("127.107.0.3:15436").await);
}

#[tokio::test]
async fn failed_bind_is_retried_on_the_next_tick() {
    let harness = Harness::new().await;

    // Squat on the address the endpoint will want.
    let squatter = tokio::net::TcpListener::bind("127.107.0.2:18448").await.unwrap();

    harness
        .daemon
        .reconcile(vec![endpoint("e1", "https://a.example:18448")])
        .await;

    // The bind failed, so the endpoint is not live and the next tick
    // retries.
    assert!(harness.endpoint_by_id("e1").await.is_none());

    drop(squatter);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    harness
        .daemon
        .reconcile(vec![endpoint("e1", "https://a.example:18448")])
        .await;
    assert!(harness.endpoint_by_id("e1").await.is_some());
    assert!(can_connect("127.107.0.2:18448").await);
}
