//! Local control socket.
//!
//! One JSON request line in, one JSON response line out, per connection.
//! Unix domain socket on Unix (permissions 0666 so the CLI works without
//! root); localhost TCP with a port file on Windows. The server reaches the
//! daemon only through the `DaemonController` capability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

/// Command from the control CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Response to the control CLI
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok(data: impl Serialize) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Daemon status as reported over the socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub registered: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator_id: String,
    pub endpoint_count: usize,
    pub ingress_endpoint: String,
}

/// A materialised local endpoint as reported over the socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub url: String,
    /// True when the local listener is running.
    pub local_listener: bool,
    /// Allocated network port, 0 in virtual mode.
    pub network_port: u16,
    /// Effective listen interface: `virtual`, `0.0.0.0`, or a concrete IP.
    pub listen_interface: String,
}

/// Operations the socket server can invoke on the daemon.
#[async_trait]
pub trait DaemonController: Send + Sync {
    async fn status(&self) -> StatusResponse;
    async fn list_endpoints(&self) -> Vec<EndpointInfo>;
    async fn set_api_key(&self, key: String) -> Result<(), String>;
}

async fn execute(controller: &Arc<dyn DaemonController>, cmd: Command) -> Response {
    debug!(command = %cmd.command, "received control command");

    match cmd.command.as_str() {
        "status" => Response::ok(controller.status().await),
        "list" => Response::ok(controller.list_endpoints().await),
        "set-api-key" => {
            let Some(key) = cmd.args.first() else {
                return Response::err("API key required");
            };
            match controller.set_api_key(key.clone()).await {
                Ok(()) => Response::ok("API key set successfully"),
                Err(e) => Response::err(e),
            }
        }
        other => Response::err(format!("unknown command: {other}")),
    }
}

async fn handle_connection<S>(stream: S, controller: Arc<dyn DaemonController>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    let mut line = String::new();
    let response = match stream.read_line(&mut line).await {
        Ok(0) => return,
        Ok(_) => match serde_json::from_str::<Command>(&line) {
            Ok(cmd) => execute(&controller, cmd).await,
            Err(e) => Response::err(format!("failed to decode command: {e}")),
        },
        Err(e) => {
            warn!(error = %e, "control socket read error");
            return;
        }
    };

    let mut json = match serde_json::to_string(&response) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "failed to encode response");
            return;
        }
    };
    json.push('\n');

    if let Err(e) = stream.get_mut().write_all(json.as_bytes()).await {
        warn!(error = %e, "failed to send response");
    }
}

#[cfg(unix)]
pub use unix::Server;

#[cfg(unix)]
mod unix {
    use super::*;
    use std::path::{Path, PathBuf};
    use tokio::net::UnixListener;

    /// Control socket server over a Unix domain socket.
    pub struct Server {
        socket_path: PathBuf,
        controller: Arc<dyn DaemonController>,
    }

    impl Server {
        pub fn new(socket_path: impl Into<PathBuf>, controller: Arc<dyn DaemonController>) -> Self {
            Self {
                socket_path: socket_path.into(),
                controller,
            }
        }

        /// Bind the socket and start the accept loop.
        pub fn start(&self) -> std::io::Result<()> {
            // A leftover socket file from a previous run blocks the bind.
            let _ = std::fs::remove_file(&self.socket_path);
            if let Some(parent) = self.socket_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let listener = UnixListener::bind(&self.socket_path)?;
            set_world_writable(&self.socket_path);

            info!(path = %self.socket_path.display(), "control socket listening");

            let controller = self.controller.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let controller = controller.clone();
                            tokio::spawn(handle_connection(stream, controller));
                        }
                        Err(e) => {
                            error!(error = %e, "control socket accept error");
                            return;
                        }
                    }
                }
            });

            Ok(())
        }
    }

    impl Drop for Server {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }

    fn set_world_writable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
            warn!(error = %e, "failed to set socket permissions");
        }
    }
}

#[cfg(windows)]
pub use windows::Server;

#[cfg(windows)]
mod windows {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    const DEFAULT_PORT: u16 = 17845;

    /// Control server over localhost TCP; the bound port is written to a
    /// file next to the configured pipe path so the CLI can find it.
    pub struct Server {
        port_file: PathBuf,
        controller: Arc<dyn DaemonController>,
    }

    impl Server {
        pub fn new(socket_path: impl Into<PathBuf>, controller: Arc<dyn DaemonController>) -> Self {
            let mut port_file = socket_path.into();
            port_file.set_extension("port");
            Self {
                port_file,
                controller,
            }
        }

        pub fn start(&self) -> std::io::Result<()> {
            let controller = self.controller.clone();
            let port_file = self.port_file.clone();

            tokio::spawn(async move {
                let listener = match TcpListener::bind(("127.0.0.1", DEFAULT_PORT)).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!(error = %e, "failed to bind control port");
                        return;
                    }
                };
                if let Ok(addr) = listener.local_addr() {
                    let _ = std::fs::write(&port_file, addr.port().to_string());
                    info!(address = %addr, "control server listening");
                }

                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let controller = controller.clone();
                            tokio::spawn(handle_connection(stream, controller));
                        }
                        Err(e) => {
                            error!(error = %e, "control accept error");
                            return;
                        }
                    }
                }
            });

            Ok(())
        }
    }
}
