//! The ngrokd daemon: polls the set of bound endpoints published for this
//! operator and converges local listener state toward it. Each endpoint
//! gets a per-hostname IP on the virtual interface, a hosts-file entry,
//! and a forwarding listener.

pub mod config;
pub mod daemon;
pub mod health;
pub mod hosts;
pub mod ipalloc;
pub mod resolver;
pub mod socket;

mod watcher;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to load config: {0}")]
    Config(String),

    #[error("registration failed: {0}")]
    Registration(#[from] ngrokd_cert::CertError),

    #[error(transparent)]
    Forward(#[from] ngrokd_forward::ForwardError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
