//! Local TCP listeners for bound endpoints.
//!
//! One accept loop per endpoint id. Accepted connections are handed to the
//! forwarder on their own task; connection lifecycle events go to a narrow
//! status-sink capability so this module stays ignorant of whoever keeps
//! the counters.

use crate::forwarder::{BoundEndpoint, Forwarder};
use crate::ForwardError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

/// Connection lifecycle callbacks.
pub trait StatusSink: Send + Sync {
    fn record_connection(&self, endpoint_name: &str);
    fn record_connection_close(&self, endpoint_name: &str);
    fn record_error(&self, endpoint_name: &str);
}

struct ActiveListener {
    cancel_tx: mpsc::Sender<()>,
}

/// Owns the accept loops, keyed by endpoint id.
pub struct ListenerManager {
    forwarder: Arc<Forwarder>,
    status_sink: Arc<dyn StatusSink>,
    listeners: Mutex<HashMap<String, ActiveListener>>,
}

impl ListenerManager {
    pub fn new(forwarder: Arc<Forwarder>, status_sink: Arc<dyn StatusSink>) -> Self {
        Self {
            forwarder,
            status_sink,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `endpoint.local_address:endpoint.local_port` and start accepting.
    ///
    /// Fails if a listener for the same endpoint id is already live, or if
    /// the address cannot be bound.
    pub async fn start_listener(&self, endpoint: BoundEndpoint) -> Result<(), ForwardError> {
        let mut listeners = self.listeners.lock().await;

        if listeners.contains_key(&endpoint.name) {
            return Err(ForwardError::ListenerExists(endpoint.name.clone()));
        }

        let local_address = if endpoint.local_address.is_empty() {
            "127.0.0.1"
        } else {
            endpoint.local_address.as_str()
        };
        let addr = format!("{}:{}", local_address, endpoint.local_port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ForwardError::Bind {
                address: addr.clone(),
                source: e,
            })?;

        info!(
            endpoint = %endpoint.name,
            address = %addr,
            target = %endpoint.uri,
            "started local listener"
        );

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);

        listeners.insert(endpoint.name.clone(), ActiveListener { cancel_tx });

        let forwarder = self.forwarder.clone();
        let status_sink = self.status_sink.clone();
        tokio::spawn(accept_connections(
            listener, endpoint, forwarder, status_sink, cancel_rx,
        ));

        Ok(())
    }

    /// Cancel and close the listener for an endpoint.
    pub async fn stop_listener(&self, endpoint_name: &str) -> Result<(), ForwardError> {
        let mut listeners = self.listeners.lock().await;

        let active = listeners
            .remove(endpoint_name)
            .ok_or_else(|| ForwardError::ListenerNotFound(endpoint_name.to_string()))?;

        info!(endpoint = %endpoint_name, "stopping listener");
        let _ = active.cancel_tx.send(()).await;
        Ok(())
    }

    /// Endpoint ids with a live listener.
    pub async fn active_endpoints(&self) -> Vec<String> {
        let listeners = self.listeners.lock().await;
        listeners.keys().cloned().collect()
    }

    /// Stop every listener.
    pub async fn close(&self) {
        let mut listeners = self.listeners.lock().await;
        info!("closing all listeners");
        for (name, active) in listeners.drain() {
            debug!(endpoint = %name, "stopping listener");
            let _ = active.cancel_tx.send(()).await;
        }
    }
}

async fn accept_connections(
    listener: TcpListener,
    endpoint: BoundEndpoint,
    forwarder: Arc<Forwarder>,
    status_sink: Arc<dyn StatusSink>,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    info!(
        endpoint = %endpoint.name,
        address = %format!("{}:{}", endpoint.local_address, endpoint.local_port),
        "accept loop started"
    );

    loop {
        let conn = tokio::select! {
            _ = cancel_rx.recv() => {
                info!(endpoint = %endpoint.name, "listener cancelled");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        let (conn, peer) = match conn {
            Ok(pair) => pair,
            Err(e) => {
                error!(endpoint = %endpoint.name, error = %e, "failed to accept connection");
                continue;
            }
        };

        debug!(from = %peer, to = %endpoint.uri, "accepted connection");
        status_sink.record_connection(&endpoint.name);

        let forwarder = forwarder.clone();
        let status_sink = status_sink.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            forward_one(conn, &endpoint, &forwarder, &status_sink).await;
        });
    }
}

async fn forward_one(
    conn: TcpStream,
    endpoint: &BoundEndpoint,
    forwarder: &Forwarder,
    status_sink: &Arc<dyn StatusSink>,
) {
    if let Err(e) = forwarder.forward_connection(conn, endpoint).await {
        error!(endpoint = %endpoint.name, error = %e, "failed to forward connection");
        status_sink.record_error(&endpoint.name);
    }
    status_sink.record_connection_close(&endpoint.name);
}
