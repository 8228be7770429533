//! Forwarding engine: mTLS dial to the binding ingress, per-connection
//! binding upgrade, protocol-aware bridging, and the local listener
//! manager that feeds it.

mod binding;
mod forwarder;
mod http;
mod listener;

pub use binding::{upgrade_to_binding_connection, BindingResponse};
pub use forwarder::{BoundEndpoint, Forwarder, ForwarderConfig};
pub use listener::{ListenerManager, StatusSink};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to dial ingress endpoint {address}: {source}")]
    Dial {
        address: String,
        source: std::io::Error,
    },

    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to parse endpoint URI {uri}: {reason}")]
    BadUri { uri: String, reason: String },

    #[error("binding upgrade failed: {0}")]
    Upgrade(String),

    #[error("listener already exists for endpoint {0}")]
    ListenerExists(String),

    #[error("no listener found for endpoint {0}")]
    ListenerNotFound(String),

    #[error("failed to create listener on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
