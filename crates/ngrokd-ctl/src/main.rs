//! ngrokctl: control CLI for the ngrokd daemon.
//!
//! Talks JSON lines over the daemon's control socket; `health` hits the
//! local HTTP status endpoint instead.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ngrokd_daemon::socket::{Command, EndpointInfo, Response, StatusResponse};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const HEALTH_ENDPOINT: &str = "http://127.0.0.1:8081";

#[derive(Parser)]
#[command(name = "ngrokctl", version, about = "Control CLI for ngrokd daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List discovered bound endpoints
    List,
    /// Check daemon health
    Health,
    /// Set ngrok API key
    SetApiKey { key: String },
    /// Manage the daemon configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Open the config file in $EDITOR; the daemon reloads on save
    Edit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => cmd_status().await,
        Commands::List => cmd_list().await,
        Commands::Health => cmd_health().await,
        Commands::SetApiKey { key } => cmd_set_api_key(&key).await,
        Commands::Config {
            command: ConfigCommands::Edit,
        } => cmd_config_edit(),
    }
}

fn socket_path() -> PathBuf {
    if let Some(path) = std::env::var_os("NGROKD_SOCKET") {
        return PathBuf::from(path);
    }
    PathBuf::from(default_socket_path())
}

#[cfg(unix)]
fn default_socket_path() -> &'static str {
    "/var/run/ngrokd.sock"
}

#[cfg(windows)]
fn default_socket_path() -> &'static str {
    r"\\.\pipe\ngrokd"
}

#[cfg(unix)]
async fn send_command(cmd: Command) -> Result<Response> {
    use tokio::net::UnixStream;

    let path = socket_path();
    let stream = UnixStream::connect(&path)
        .await
        .with_context(|| format!("failed to connect to daemon at {} - is ngrokd running?", path.display()))?;

    exchange(stream, cmd).await
}

#[cfg(windows)]
async fn send_command(cmd: Command) -> Result<Response> {
    use tokio::net::TcpStream;

    let mut port_file = socket_path();
    port_file.set_extension("port");
    let port: u16 = std::fs::read_to_string(&port_file)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(17845);

    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to connect to daemon on port {port} - is ngrokd running?"))?;

    exchange(stream, cmd).await
}

async fn exchange<S>(stream: S, cmd: Command) -> Result<Response>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    let mut json = serde_json::to_string(&cmd)?;
    json.push('\n');
    stream
        .get_mut()
        .write_all(json.as_bytes())
        .await
        .context("failed to send command")?;

    let mut line = String::new();
    stream
        .read_line(&mut line)
        .await
        .context("failed to read response")?;

    serde_json::from_str(&line).context("failed to parse response")
}

fn require_success(response: &Response) -> Result<()> {
    if !response.success {
        bail!("{}", response.error.as_deref().unwrap_or("unknown error"));
    }
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let response = send_command(Command {
        command: "status".to_string(),
        args: vec![],
    })
    .await?;
    require_success(&response)?;

    let status: StatusResponse =
        serde_json::from_value(response.data.context("empty response")?)
            .context("unexpected response shape")?;

    println!("ngrokd daemon status");
    println!("--------------------");
    if status.registered {
        println!("  registered:   yes");
        println!("  operator id:  {}", status.operator_id);
    } else {
        println!("  registered:   no (waiting for API key)");
    }
    println!("  endpoints:    {}", status.endpoint_count);
    println!("  ingress:      {}", status.ingress_endpoint);

    if status.endpoint_count == 0 {
        println!();
        println!("No endpoints discovered yet. Run 'ngrokctl list' once some exist.");
    }
    Ok(())
}

async fn cmd_list() -> Result<()> {
    let response = send_command(Command {
        command: "list".to_string(),
        args: vec![],
    })
    .await?;
    require_success(&response)?;

    let mut endpoints: Vec<EndpointInfo> =
        serde_json::from_value(response.data.context("empty response")?)
            .context("unexpected response shape")?;

    if endpoints.is_empty() {
        println!("No endpoints discovered.");
        println!();
        println!("Endpoints are discovered automatically on each poll; make sure");
        println!("bound endpoints exist for this operator.");
        return Ok(());
    }

    endpoints.sort_by(|a, b| a.url.cmp(&b.url));

    println!(
        "{:<40} {:<22} {:<10} {:<12} STATUS",
        "URL", "IP:PORT", "NETWORK", "LISTEN"
    );
    for ep in &endpoints {
        let status = if ep.local_listener {
            "ok"
        } else if ep.network_port > 0 {
            "network only"
        } else {
            "unavailable"
        };
        let network = if ep.network_port > 0 {
            format!(":{}", ep.network_port)
        } else {
            "-".to_string()
        };

        println!(
            "{:<40} {:<22} {:<10} {:<12} {}",
            ep.url,
            format!("{}:{}", ep.ip, ep.port),
            network,
            ep.listen_interface,
            status
        );
    }
    println!();
    println!("Total: {} endpoint(s)", endpoints.len());
    Ok(())
}

async fn cmd_health() -> Result<()> {
    let body = reqwest::get(format!("{HEALTH_ENDPOINT}/status"))
        .await
        .context("failed to connect to health endpoint - is ngrokd running?")?
        .text()
        .await
        .context("failed to read health response")?;

    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{body}"),
    }
    Ok(())
}

async fn cmd_set_api_key(key: &str) -> Result<()> {
    let response = send_command(Command {
        command: "set-api-key".to_string(),
        args: vec![key.to_string()],
    })
    .await?;
    require_success(&response)?;

    println!("API key set successfully");
    println!();
    println!("The daemon will now:");
    println!("  1. Register with the ngrok API");
    println!("  2. Provision mTLS certificates");
    println!("  3. Start polling for bound endpoints");
    println!();
    println!("Run 'ngrokctl status' to check registration status");
    Ok(())
}

fn cmd_config_edit() -> Result<()> {
    let config_path = std::env::var_os("NGROKD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default_config_path()));

    if !config_path.exists() {
        bail!("config file not found: {}", config_path.display());
    }

    let editor = std::env::var_os("EDITOR")
        .or_else(|| std::env::var_os("VISUAL"))
        .unwrap_or_else(|| "vi".into());

    println!(
        "Opening {} with {}...",
        config_path.display(),
        editor.to_string_lossy()
    );

    let status = std::process::Command::new(&editor)
        .arg(&config_path)
        .status()
        .with_context(|| format!("failed to launch {}", editor.to_string_lossy()))?;

    if !status.success() {
        bail!("editor exited with {status}");
    }

    println!("Saved. The daemon reloads changed settings automatically.");
    Ok(())
}

#[cfg(unix)]
fn default_config_path() -> &'static str {
    "/etc/ngrokd/config.yml"
}

#[cfg(windows)]
fn default_config_path() -> &'static str {
    r"C:\ProgramData\ngrokd\config.yml"
}
