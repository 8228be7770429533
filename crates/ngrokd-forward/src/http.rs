//! Host-header rewriting for HTTP(S) endpoints.
//!
//! Bound HTTP endpoints route on the Host header, but local clients send
//! whatever name they connected to (localhost, an allocated IP, ...). The
//! first request on each connection is parsed and its Host replaced with
//! the endpoint hostname; everything after that is bridged verbatim. If the
//! bytes do not parse as HTTP they are forwarded untouched.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const MAX_HEADERS: usize = 100;

/// Cap on the request head; beyond this the connection is treated as raw.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Outcome of reading the first request head from the local side.
pub(crate) enum HeadOutcome {
    /// Parsed head rewritten to `target_host`, plus any body bytes that were
    /// already buffered past the head.
    Rewritten { head: Vec<u8>, remainder: BytesMut },
    /// Not parseable as HTTP; forward whatever was buffered untouched.
    Raw(BytesMut),
}

/// Read one request head from `local` and rewrite its Host header.
///
/// Never consumes more of the stream than the head plus whatever the reads
/// happened to buffer; the unconsumed remainder is returned either way.
pub(crate) async fn read_and_rewrite_head<R>(
    local: &mut R,
    target_host: &str,
) -> std::io::Result<HeadOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        match request.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let head = rewrite_head(&request, target_host);
                let remainder = buf.split_off(head_len);
                debug!(host = target_host, "rewrote Host header");
                return Ok(HeadOutcome::Rewritten { head, remainder });
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() >= MAX_HEAD_SIZE {
                    return Ok(HeadOutcome::Raw(buf));
                }
            }
            Err(_) => return Ok(HeadOutcome::Raw(buf)),
        }

        let n = local.read_buf(&mut buf).await?;
        if n == 0 {
            // EOF before a complete head; nothing left to parse.
            return Ok(HeadOutcome::Raw(buf));
        }
    }
}

fn rewrite_head(request: &httparse::Request<'_, '_>, target_host: &str) -> Vec<u8> {
    let method = request.method.unwrap_or("GET");
    let path = request.path.unwrap_or("/");
    let minor = request.version.unwrap_or(1);

    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(format!("{method} {path} HTTP/1.{minor}\r\n").as_bytes());
    head.extend_from_slice(format!("Host: {target_host}\r\n").as_bytes());

    for header in request.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            continue;
        }
        head.extend_from_slice(header.name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(header.value);
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Rewrite the first request from `local`, send it to `remote`, then bridge
/// the rest of both directions until one side finishes.
pub(crate) async fn rewrite_http_host<L, R>(
    mut local: L,
    mut remote: R,
    target_host: &str,
) -> std::io::Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    match read_and_rewrite_head(&mut local, target_host).await? {
        HeadOutcome::Rewritten { head, remainder } => {
            remote.write_all(&head).await?;
            if !remainder.is_empty() {
                remote.write_all(&remainder).await?;
            }
            remote.flush().await?;
        }
        HeadOutcome::Raw(buffered) => {
            if !buffered.is_empty() {
                remote.write_all(&buffered).await?;
                remote.flush().await?;
            }
        }
    }

    raw_proxy(local, remote).await
}

/// Symmetric byte bridge: ends when either direction hits EOF or errors,
/// closing both sides on return.
pub(crate) async fn raw_proxy<L, R>(local: L, remote: R) -> std::io::Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    tokio::select! {
        result = tokio::io::copy(&mut local_read, &mut remote_write) => {
            result.map(|_| ())
        }
        result = tokio::io::copy(&mut remote_read, &mut local_write) => {
            result.map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rewrites_host_header() {
        let (mut client, local) = tokio::io::duplex(4096);
        let (remote, mut upstream) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            client
                .write_all(b"GET / HTTP/1.1\r\nHost: localhost:443\r\nAccept: */*\r\n\r\n")
                .await
                .unwrap();
            // Keep the local side open; the bridge ends when upstream drops.
            let mut sink = Vec::new();
            let _ = client.read_to_end(&mut sink).await;
        });

        let bridge = tokio::spawn(async move {
            let _ = rewrite_http_host(local, remote, "a.example").await;
        });

        let mut received = vec![0u8; 1024];
        let n = upstream.read(&mut received).await.unwrap();
        let text = String::from_utf8_lossy(&received[..n]).into_owned();

        assert!(text.starts_with("GET / HTTP/1.1\r\nHost: a.example\r\n"));
        assert!(text.contains("Accept: */*"));
        assert!(!text.contains("localhost"));

        drop(upstream);
        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn body_bytes_buffered_past_head_are_preserved() {
        let (mut client, local) = tokio::io::duplex(4096);
        let (remote, mut upstream) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            client
                .write_all(
                    b"POST /submit HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 5\r\n\r\nhello",
                )
                .await
                .unwrap();
            let mut sink = Vec::new();
            let _ = client.read_to_end(&mut sink).await;
        });

        let bridge = tokio::spawn(async move {
            let _ = rewrite_http_host(local, remote, "b.example").await;
        });

        let mut received = Vec::new();
        let mut chunk = vec![0u8; 1024];
        while !String::from_utf8_lossy(&received).contains("hello") {
            let n = upstream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..n]);
        }
        let text = String::from_utf8_lossy(&received).into_owned();

        assert!(text.starts_with("POST /submit HTTP/1.1\r\nHost: b.example\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));

        drop(upstream);
        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn non_http_falls_back_to_raw() {
        let (mut client, local) = tokio::io::duplex(4096);
        let (remote, mut upstream) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            client.write_all(b"\x00\x01\x02PGSQL").await.unwrap();
            let mut sink = Vec::new();
            let _ = client.read_to_end(&mut sink).await;
        });

        let bridge = tokio::spawn(async move {
            let _ = rewrite_http_host(local, remote, "db.example").await;
        });

        let mut received = vec![0u8; 64];
        let n = upstream.read(&mut received).await.unwrap();
        assert_eq!(&received[..n], b"\x00\x01\x02PGSQL");

        drop(upstream);
        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn raw_proxy_copies_both_directions() {
        let (mut client, local) = tokio::io::duplex(4096);
        let (remote, mut upstream) = tokio::io::duplex(4096);

        let bridge = tokio::spawn(async move {
            let _ = raw_proxy(local, remote).await;
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = vec![0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        drop(upstream);
        bridge.await.unwrap();
    }
}
