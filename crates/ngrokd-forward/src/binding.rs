//! Binding-protocol upgrade.
//!
//! After the mTLS handshake the channel is still addressed at the ingress,
//! not at any particular bound endpoint. This exchange names the endpoint
//! `(hostname, port)` the connection is for; the ingress answers with the
//! endpoint id and its application protocol, after which the channel carries
//! opaque endpoint bytes.
//!
//! The wire shape is shared with the ingress: one version-tagged JSON body
//! per direction, each behind a u32 big-endian length prefix.

use crate::ForwardError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const BINDING_VERSION: u16 = 1;

/// Upper bound on a single upgrade frame.
const MAX_FRAME_SIZE: u32 = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct BindingRequest {
    version: u16,
    host: String,
    port: u16,
}

/// Ingress response to a binding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingResponse {
    #[serde(default)]
    pub endpoint_id: String,
    #[serde(default)]
    pub proto: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Perform the binding upgrade on an established ingress channel.
pub async fn upgrade_to_binding_connection<S>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> Result<BindingResponse, ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = BindingRequest {
        version: BINDING_VERSION,
        host: host.to_string(),
        port,
    };

    write_frame(stream, &serde_json::to_vec(&request).map_err(io_invalid)?).await?;
    debug!(host, port, "sent binding upgrade request");

    let payload = read_frame(stream).await?;
    let response: BindingResponse = serde_json::from_slice(&payload)
        .map_err(|e| ForwardError::Upgrade(format!("unparseable response: {e}")))?;

    if let Some(code) = &response.error_code {
        let message = response.error_message.as_deref().unwrap_or("");
        return Err(ForwardError::Upgrade(format!("{code}: {message}")));
    }

    debug!(
        endpoint_id = %response.endpoint_id,
        proto = %response.proto,
        "binding upgrade complete"
    );
    Ok(response)
}

async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<(), ForwardError>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(ForwardError::Upgrade(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>, ForwardError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(ForwardError::Upgrade(format!("frame too large: {len} bytes")));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

fn io_invalid(e: serde_json::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upgrade_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let payload = read_frame(&mut server).await.unwrap();
            let request: BindingRequest = serde_json::from_slice(&payload).unwrap();
            assert_eq!(request.version, BINDING_VERSION);
            assert_eq!(request.host, "a.example");
            assert_eq!(request.port, 443);

            let response = BindingResponse {
                endpoint_id: "ep_1".to_string(),
                proto: "https".to_string(),
                error_code: None,
                error_message: None,
            };
            write_frame(&mut server, &serde_json::to_vec(&response).unwrap())
                .await
                .unwrap();
        });

        let response = upgrade_to_binding_connection(&mut client, "a.example", 443)
            .await
            .unwrap();
        assert_eq!(response.endpoint_id, "ep_1");
        assert_eq!(response.proto, "https");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn upgrade_surfaces_ingress_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let _ = read_frame(&mut server).await.unwrap();
            let response = BindingResponse {
                endpoint_id: String::new(),
                proto: String::new(),
                error_code: Some("ERR_NGROK_3201".to_string()),
                error_message: Some("endpoint not bound".to_string()),
            };
            write_frame(&mut server, &serde_json::to_vec(&response).unwrap())
                .await
                .unwrap();
        });

        match upgrade_to_binding_connection(&mut client, "gone.example", 443).await {
            Err(ForwardError::Upgrade(msg)) => {
                assert!(msg.contains("ERR_NGROK_3201"));
                assert!(msg.contains("endpoint not bound"));
            }
            other => panic!("expected upgrade error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let _ = read_frame(&mut server).await.unwrap();
            // Announce an absurd frame length without sending a body.
            server
                .write_all(&(10 * 1024 * 1024u32).to_be_bytes())
                .await
                .unwrap();
        });

        match upgrade_to_binding_connection(&mut client, "a.example", 443).await {
            Err(ForwardError::Upgrade(msg)) => assert!(msg.contains("too large")),
            other => panic!("expected frame-size error, got {other:?}"),
        }
    }
}
