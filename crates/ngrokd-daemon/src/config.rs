//! Daemon configuration.
//!
//! Loaded from YAML at startup and re-parsed on file change; only a subset
//! of fields is hot-reloadable (poll interval, listen-interface policy,
//! start port). A failed reload keeps the running configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(
        default = "default_ingress_endpoint",
        rename = "ingressEndpoint",
        skip_serializing_if = "String::is_empty"
    )]
    pub ingress_endpoint: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub bound_endpoints: BoundEndpointsConfig,

    #[serde(default)]
    pub net: NetConfig,
}

/// ngrok API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default = "default_client_cert")]
    pub client_cert: String,
    #[serde(default = "default_client_key")]
    pub client_key: String,
}

/// Bound-endpoint polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundEndpointsConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_selectors")]
    pub selectors: Vec<String>,
}

/// Network interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default = "default_interface_name")]
    pub interface_name: String,
    #[serde(default = "default_subnet")]
    pub subnet: String,
    /// `virtual`, `0.0.0.0`, a concrete IP, or an interface name.
    #[serde(default = "default_listen_interface")]
    pub listen_interface: String,
    /// First port handed out in network mode.
    #[serde(default = "default_start_port")]
    pub start_port: u16,
    /// Per-hostname listen-interface overrides.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub overrides: HashMap<String, String>,
}

fn default_api_url() -> String {
    "https://api.ngrok.com".to_string()
}

fn default_ingress_endpoint() -> String {
    "kubernetes-binding-ingress.ngrok.io:443".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(unix)]
fn default_socket_path() -> String {
    "/var/run/ngrokd.sock".to_string()
}

#[cfg(windows)]
fn default_socket_path() -> String {
    r"\\.\pipe\ngrokd".to_string()
}

#[cfg(unix)]
fn default_client_cert() -> String {
    "/etc/ngrokd/tls.crt".to_string()
}

#[cfg(unix)]
fn default_client_key() -> String {
    "/etc/ngrokd/tls.key".to_string()
}

#[cfg(windows)]
fn default_client_cert() -> String {
    program_data().join("ngrokd").join("tls.crt").display().to_string()
}

#[cfg(windows)]
fn default_client_key() -> String {
    program_data().join("ngrokd").join("tls.key").display().to_string()
}

#[cfg(windows)]
fn program_data() -> PathBuf {
    std::env::var_os("ProgramData")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
}

fn default_poll_interval() -> u64 {
    30
}

fn default_selectors() -> Vec<String> {
    vec!["true".to_string()]
}

fn default_interface_name() -> String {
    "ngrokd0".to_string()
}

fn default_subnet() -> String {
    "10.107.0.0/16".to_string()
}

fn default_listen_interface() -> String {
    "virtual".to_string()
}

fn default_start_port() -> u16 {
    9080
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            key: String::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            socket_path: default_socket_path(),
            client_cert: default_client_cert(),
            client_key: default_client_key(),
        }
    }
}

impl Default for BoundEndpointsConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            selectors: default_selectors(),
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            interface_name: default_interface_name(),
            subnet: default_subnet(),
            listen_interface: default_listen_interface(),
            start_port: default_start_port(),
            overrides: HashMap::new(),
        }
    }
}

impl DaemonConfig {
    /// Load and default-fill the configuration.
    pub fn load(path: &Path) -> Result<Self, String> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {e}", path.display()))?;
        let mut cfg: DaemonConfig = serde_yaml::from_str(&data)
            .map_err(|e| format!("failed to parse config file {}: {e}", path.display()))?;
        if cfg.ingress_endpoint.is_empty() {
            cfg.ingress_endpoint = default_ingress_endpoint();
        }
        Ok(cfg)
    }

    /// Validate reload candidates; the message names what to fix.
    pub fn validate(&self) -> Result<(), String> {
        if self.bound_endpoints.poll_interval == 0 {
            return Err("poll_interval must be > 0".to_string());
        }
        if self.bound_endpoints.poll_interval < 5 {
            warn!("poll_interval < 5s may hit API rate limits");
        }

        validate_listen_spec("listen_interface", &self.net.listen_interface)?;
        for (hostname, spec) in &self.net.overrides {
            validate_listen_spec(&format!("override for '{hostname}'"), spec)?;
        }

        if self.net.start_port == 0 {
            return Err("start_port must be between 1 and 65535".to_string());
        }

        self.net
            .subnet
            .parse::<ipnet::Ipv4Net>()
            .map_err(|e| format!("invalid subnet '{}': {e}", self.net.subnet))?;

        Ok(())
    }

    /// Directory holding certs and persistence files, derived from the
    /// client-cert path.
    pub fn cert_dir(&self) -> PathBuf {
        let path = Path::new(&self.server.client_cert);
        path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/etc/ngrokd"))
    }

    /// Listen interface effective for a hostname: override else default.
    pub fn listen_interface_for(&self, hostname: &str) -> String {
        self.net
            .overrides
            .get(hostname)
            .cloned()
            .unwrap_or_else(|| self.net.listen_interface.clone())
    }

    /// Persist a new API key into the config file, atomically, mode 0600.
    pub fn save_api_key(path: &Path, api_key: &str) -> Result<(), String> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {e}", path.display()))?;
        let mut cfg: DaemonConfig = serde_yaml::from_str(&data)
            .map_err(|e| format!("failed to parse config file {}: {e}", path.display()))?;

        cfg.api.key = api_key.to_string();

        let updated =
            serde_yaml::to_string(&cfg).map_err(|e| format!("failed to serialize config: {e}"))?;

        let temp_path = path.with_extension("yml.tmp");
        std::fs::write(&temp_path, updated)
            .map_err(|e| format!("failed to write {}: {e}", temp_path.display()))?;
        restrict_permissions(&temp_path);

        if let Err(e) = std::fs::rename(&temp_path, path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(format!("failed to replace config file: {e}"));
        }
        Ok(())
    }
}

fn validate_listen_spec(what: &str, spec: &str) -> Result<(), String> {
    if spec == "virtual" || spec == "0.0.0.0" {
        return Ok(());
    }
    if spec.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    // Interface names are resolved at bind time; restrict to plausible ones.
    if !spec.is_empty()
        && spec
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Ok(());
    }
    Err(format!(
        "{what} must be 'virtual', '0.0.0.0', an IP address, or an interface name (got '{spec}')"
    ))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_file_gets_all_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "{}").unwrap();

        let cfg = DaemonConfig::load(&path).unwrap();
        assert_eq!(cfg.api.url, "https://api.ngrok.com");
        assert_eq!(cfg.ingress_endpoint, "kubernetes-binding-ingress.ngrok.io:443");
        assert_eq!(cfg.bound_endpoints.poll_interval, 30);
        assert_eq!(cfg.net.interface_name, "ngrokd0");
        assert_eq!(cfg.net.subnet, "10.107.0.0/16");
        assert_eq!(cfg.net.listen_interface, "virtual");
        assert_eq!(cfg.net.start_port, 9080);
        #[cfg(unix)]
        assert_eq!(cfg.server.socket_path, "/var/run/ngrokd.sock");
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            concat!(
                "api:\n  key: test-key\n",
                "net:\n  listen_interface: 0.0.0.0\n  start_port: 9100\n",
                "  overrides:\n    a.example: 10.0.0.5\n",
                "bound_endpoints:\n  poll_interval: 10\n",
            ),
        )
        .unwrap();

        let cfg = DaemonConfig::load(&path).unwrap();
        assert_eq!(cfg.api.key, "test-key");
        assert_eq!(cfg.api.url, "https://api.ngrok.com");
        assert_eq!(cfg.net.listen_interface, "0.0.0.0");
        assert_eq!(cfg.net.start_port, 9100);
        assert_eq!(cfg.net.overrides["a.example"], "10.0.0.5");
        assert_eq!(cfg.bound_endpoints.poll_interval, 10);
    }

    #[test]
    fn validation_rejects_zero_poll_interval() {
        let mut cfg = DaemonConfig::default();
        cfg.net = NetConfig::default();
        cfg.bound_endpoints = BoundEndpointsConfig {
            poll_interval: 0,
            selectors: vec![],
        };
        assert!(cfg.validate().unwrap_err().contains("poll_interval"));
    }

    #[test]
    fn validation_rejects_bad_listen_interface() {
        let mut cfg = DaemonConfig::default();
        cfg.net.listen_interface = "not valid!".to_string();
        assert!(cfg.validate().unwrap_err().contains("listen_interface"));
    }

    #[test]
    fn validation_rejects_bad_override() {
        let mut cfg = DaemonConfig::default();
        cfg.net
            .overrides
            .insert("a.example".to_string(), "bad value!".to_string());
        assert!(cfg.validate().unwrap_err().contains("a.example"));
    }

    #[test]
    fn validation_rejects_zero_start_port() {
        let mut cfg = DaemonConfig::default();
        cfg.net.start_port = 0;
        assert!(cfg.validate().unwrap_err().contains("start_port"));
    }

    #[test]
    fn validation_accepts_defaults() {
        let mut cfg = DaemonConfig::default();
        cfg.net = NetConfig::default();
        cfg.bound_endpoints = BoundEndpointsConfig::default();
        cfg.validate().unwrap();
    }

    #[test]
    fn listen_interface_override_wins() {
        let mut cfg = DaemonConfig::default();
        cfg.net = NetConfig::default();
        cfg.net
            .overrides
            .insert("a.example".to_string(), "0.0.0.0".to_string());

        assert_eq!(cfg.listen_interface_for("a.example"), "0.0.0.0");
        assert_eq!(cfg.listen_interface_for("b.example"), "virtual");
    }

    #[test]
    fn save_api_key_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "net:\n  start_port: 9100\n").unwrap();

        DaemonConfig::save_api_key(&path, "new-key").unwrap();

        let cfg = DaemonConfig::load(&path).unwrap();
        assert_eq!(cfg.api.key, "new-key");
        // Unrelated settings survive the rewrite.
        assert_eq!(cfg.net.start_port, 9100);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn cert_dir_derives_from_client_cert() {
        let mut cfg = DaemonConfig::default();
        cfg.server = ServerConfig::default();
        cfg.server.client_cert = "/opt/ngrokd/certs/tls.crt".to_string();
        assert_eq!(cfg.cert_dir(), PathBuf::from("/opt/ngrokd/certs"));
    }
}
