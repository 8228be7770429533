use anyhow::{Context, Result};
use clap::Parser;
use ngrokd_daemon::daemon::Daemon;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "ngrokd", version, about = "Forwards ngrok bound endpoints to local listeners")]
struct Cli {
    /// Path to the daemon configuration file
    #[arg(long, default_value = default_config_path())]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[cfg(unix)]
const fn default_config_path() -> &'static str {
    "/etc/ngrokd/config.yml"
}

#[cfg(windows)]
const fn default_config_path() -> &'static str {
    r"C:\ProgramData\ngrokd\config.yml"
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to initialize logging")?;

    let daemon = Daemon::new(&cli.config)
        .with_context(|| format!("failed to load daemon from {}", cli.config.display()))?;

    daemon.run().await.context("daemon exited with error")?;
    Ok(())
}
