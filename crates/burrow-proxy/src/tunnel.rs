//! CONNECT tunneling: upstream dialing, connection takeover, and the
//! per-direction byte relays.

use crate::proxy::{empty, error_response};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Bound on upstream connection establishment. Established tunnels carry
/// no idle or total-duration timeout.
pub const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a CONNECT request: dial the target, acknowledge with an empty
/// 200, take over the client transport once hyper finishes the upgrade,
/// and hand one relay task each direction.
///
/// Returns immediately after the response is built; the relays outlive
/// this call and terminate on their own when either peer closes.
pub async fn handle_connect<B>(mut req: Request<B>) -> Response<BoxBody<Bytes, hyper::Error>> {
    // CONNECT carries a bare authority ("host:port") in the request line.
    let authority = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => {
            warn!("CONNECT target is not host:port: {:?}", req.uri());
            return error_response(
                StatusCode::BAD_REQUEST,
                "CONNECT must be to a host:port address",
            );
        }
    };

    let upstream = match timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(authority.as_str()))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!("CONNECT dial to {} failed: {}", authority, err);
            return error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string());
        }
        Err(_) => {
            warn!(
                "CONNECT dial to {} timed out after {:?}",
                authority, UPSTREAM_DIAL_TIMEOUT
            );
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("dial tcp {authority}: i/o timeout"),
            );
        }
    };

    // The listener must have served this connection with upgrade support,
    // otherwise there is no raw transport to relay. Returning here drops
    // the freshly dialed upstream socket, closing it.
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        error!(
            "connection takeover not supported, cannot tunnel to {}",
            authority
        );
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Hijacking not supported");
    };

    // hyper only yields the raw client transport after the 200 below has
    // been written, so the takeover completes in a background task. Each
    // relay owns one read half and one write half exclusively; the two
    // directions may finish at different times.
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let (client_rx, client_tx) = tokio::io::split(TokioIo::new(upgraded));
                let (upstream_rx, upstream_tx) = upstream.into_split();
                tokio::spawn(relay(client_rx, upstream_tx));
                tokio::spawn(relay(upstream_rx, client_tx));
            }
            Err(err) => {
                // Upstream is dropped here, closing it.
                warn!("client takeover failed for CONNECT {}: {}", authority, err);
            }
        }
    });

    // Empty 200 acknowledges tunnel establishment per CONNECT semantics.
    Response::new(empty())
}

/// Copy bytes from `src` to `dst` until EOF or an I/O error, then shut the
/// destination down and release the source. Errors end the direction
/// silently; once raw tunneling has begun no HTTP response is possible.
pub async fn relay<R, W>(mut src: R, mut dst: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut src, &mut dst).await {
        Ok(bytes) => debug!("relay finished after {} bytes", bytes),
        Err(err) => debug!("relay ended: {}", err),
    }
    // Propagate FIN so the peer's reader unblocks; the opposite direction
    // keeps running until its own source is exhausted.
    let _ = dst.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::Method;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_without_authority_is_rejected_before_dialing() {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("/")
            .body(())
            .unwrap();

        let response = handle_connect(req).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // The authority check answers before any dial is attempted; the
        // dial paths carry the I/O error text instead of this message.
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("CONNECT must be to a host:port address"));
    }

    #[tokio::test]
    async fn test_relay_copies_bytes_in_order_until_eof() {
        let (client_side, mut client_peer) = tokio::io::duplex(16);
        let (server_side, mut server_peer) = tokio::io::duplex(16);
        let (client_rx, _client_tx) = tokio::io::split(client_side);
        let (_server_rx, server_tx) = tokio::io::split(server_side);

        tokio::spawn(relay(client_rx, server_tx));

        // Multiple writes, smaller than and larger than the duplex buffer.
        client_peer.write_all(b"hello ").await.unwrap();
        client_peer.write_all(b"tunnel, this spans buffers").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut out = Vec::new();
        server_peer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello tunnel, this spans buffers");
    }

    #[tokio::test]
    async fn test_relay_shutdown_propagates_eof_to_destination() {
        let (client_side, mut client_peer) = tokio::io::duplex(16);
        let (server_side, mut server_peer) = tokio::io::duplex(16);
        let (client_rx, _client_tx) = tokio::io::split(client_side);
        let (_server_rx, server_tx) = tokio::io::split(server_side);

        tokio::spawn(relay(client_rx, server_tx));

        client_peer.shutdown().await.unwrap();

        // With no bytes written, the destination must still observe EOF
        // rather than block.
        let mut out = Vec::new();
        server_peer.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_relay_directions_terminate_independently() {
        // Two relays wired like a tunnel: a <-> b through separate pairs.
        let (a_side, mut a_peer) = tokio::io::duplex(16);
        let (b_side, mut b_peer) = tokio::io::duplex(16);
        let (a_rx, a_tx) = tokio::io::split(a_side);
        let (b_rx, b_tx) = tokio::io::split(b_side);

        tokio::spawn(relay(a_rx, b_tx));
        tokio::spawn(relay(b_rx, a_tx));

        // Close a's write side; the a->b direction drains and ends.
        a_peer.write_all(b"last words").await.unwrap();
        a_peer.shutdown().await.unwrap();

        let mut buf = vec![0u8; 10];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"last words");

        // The b->a direction is still live after a->b finished.
        b_peer.write_all(b"still open").await.unwrap();
        let mut buf = vec![0u8; 10];
        a_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still open");
    }
}
