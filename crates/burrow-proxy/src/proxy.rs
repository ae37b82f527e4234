//! Listener, request dispatch, and the plain (non-CONNECT) relay path.

use crate::config::{ListenConfig, Protocol};
use crate::tunnel;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::CertificateDer;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Connect timeout for plain-relay requests to the origin.
const ORIGIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type HttpClient = Client<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    Incoming,
>;

/// Create TLS acceptor from certificate and key files
fn create_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, anyhow::Error> {
    // Load certificate chain
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{cert_path}': {e}"))?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate file: {e}"))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in certificate file: {cert_path}");
    }

    // Load private key (PKCS8, RSA, or EC)
    let key_file = std::fs::File::open(key_path)
        .map_err(|e| anyhow::anyhow!("Failed to open private key file '{key_path}': {e}"))?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse private key file: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in key file: {key_path}"))?;

    // No ALPN is configured, so the TLS listener never negotiates HTTP/2
    // and serves classic request/response framing only.
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("Failed to build TLS configuration: {e}"))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// The forward proxy: accepts client connections (plaintext or
/// TLS-terminated) and dispatches each request to the CONNECT tunnel
/// handler or the plain relay. Holds no state across requests.
pub struct ProxyServer {
    config: ListenConfig,
    http_client: HttpClient, // Shared outbound client for plain relaying
}

impl ProxyServer {
    pub fn new(config: ListenConfig) -> Result<Self, anyhow::Error> {
        // rustls requires a process-level crypto provider before any TLS
        // config is built; installing twice is a no-op.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut http_connector = hyper_util::client::legacy::connect::HttpConnector::new();
        http_connector.set_connect_timeout(Some(ORIGIN_CONNECT_TIMEOUT));
        http_connector.enforce_http(false); // Allow both HTTP and HTTPS origins

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| anyhow::anyhow!("Failed to load native root certificates: {e}"))?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let http_client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .build(https_connector);

        Ok(Self {
            config,
            http_client,
        })
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await?;
        let protocol = self.config.protocol;

        // Create TLS acceptor if protocol is HTTPS
        let tls_acceptor = if protocol == Protocol::Https {
            let tls_config = self.config.tls.as_ref().ok_or_else(|| {
                anyhow::anyhow!("TLS configuration required for HTTPS listener")
            })?;
            Some(create_tls_acceptor(
                &tls_config.cert_path,
                &tls_config.key_path,
            )?)
        } else {
            None
        };

        info!("Listening on {}://{}", protocol.as_str(), addr);

        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&server);
            let tls_acceptor = tls_acceptor.clone();

            tokio::spawn(async move {
                match protocol {
                    Protocol::Https => {
                        // HTTPS: perform TLS handshake first
                        let acceptor =
                            tls_acceptor.expect("TLS acceptor must be present for HTTPS");
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                let io = TokioIo::new(tls_stream);
                                let service = service_fn(move |req| {
                                    let server = Arc::clone(&server);
                                    async move { server.handle_request(req).await }
                                });

                                if let Err(err) = http1::Builder::new()
                                    .preserve_header_case(true)
                                    .serve_connection(io, service)
                                    .with_upgrades()
                                    .await
                                {
                                    error!(
                                        "Error serving HTTPS connection from {}: {}",
                                        remote_addr, err
                                    );
                                }
                            }
                            Err(err) => {
                                error!("TLS handshake failed from {}: {}", remote_addr, err);
                            }
                        }
                    }
                    Protocol::Http => {
                        // HTTP: serve directly
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let server = Arc::clone(&server);
                            async move { server.handle_request(req).await }
                        });

                        if let Err(err) = http1::Builder::new()
                            .preserve_header_case(true)
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            error!(
                                "Error serving HTTP connection from {}: {}",
                                remote_addr, err
                            );
                        }
                    }
                }
            });
        }
    }

    /// Route CONNECT to the tunnel handler, everything else to the plain
    /// relay. All failures become HTTP responses, never service errors.
    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        if req.method() == Method::CONNECT {
            info!("tunneling CONNECT {}", req.uri());
            Ok(tunnel::handle_connect(req).await)
        } else {
            info!("relaying {} {}", req.method(), req.uri());
            Ok(self.forward_request(req).await)
        }
    }

    /// Re-issue a non-CONNECT request to the origin and return its
    /// response verbatim, streaming the body.
    async fn forward_request(
        &self,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        // Clients speaking to a forward proxy send absolute-form URIs;
        // origin-form requests are re-addressed via the Host header.
        let req = if req.uri().scheme().is_some() {
            req
        } else {
            match readdress_to_host_header(req) {
                Ok(req) => req,
                Err(response) => return response,
            }
        };

        debug!("Forwarding to origin: {}", req.uri());

        match self.http_client.request(req).await {
            // Status, headers (multiplicity and per-key order included)
            // and body pass through untouched; the streamed body releases
            // origin resources when the copy finishes or fails.
            Ok(response) => response.map(|body| body.boxed()),
            Err(err) => {
                warn!("Failed to reach origin: {}", err);
                error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
            }
        }
    }
}

/// Rewrite an origin-form request ("GET / HTTP/1.1" + Host header) into
/// absolute form so the outbound client knows where to dial.
fn readdress_to_host_header(
    req: Request<Incoming>,
) -> Result<Request<Incoming>, Response<BoxBody<Bytes, hyper::Error>>> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "request target has no scheme and no Host header",
            )
        })?;

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("http://{host}{path}").parse().map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            &format!("invalid request target: {e}"),
        )
    })?;

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    Ok(Request::from_parts(parts, body))
}

pub(crate) fn error_response(
    status: StatusCode,
    message: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full(message.to_string()))
        .unwrap()
}

pub(crate) fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ============================================
    // Tests for error_response helper function
    // ============================================

    #[tokio::test]
    async fn test_error_response_carries_message_body() {
        let response = error_response(StatusCode::SERVICE_UNAVAILABLE, "dial tcp: refused");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("dial tcp: refused"));
    }

    #[tokio::test]
    async fn test_error_response_500() {
        let response = error_response(StatusCode::INTERNAL_SERVER_ERROR, "Hijacking not supported");
        assert_eq!(response.status(), 500);
    }

    #[tokio::test]
    async fn test_empty_body_is_empty() {
        let body = empty().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    // ============================================
    // Tests for TLS acceptor loading
    // ============================================

    #[test]
    fn test_create_tls_acceptor_missing_cert_file() {
        let result = create_tls_acceptor("/nonexistent/server.crt", "/nonexistent/server.key");
        assert!(result.is_err());
        assert!(result.err().unwrap().to_string().contains("certificate file"));
    }

    #[test]
    fn test_create_tls_acceptor_rejects_non_pem_cert() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "this is not a certificate").unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        writeln!(key, "this is not a key").unwrap();

        let result = create_tls_acceptor(
            cert.path().to_str().unwrap(),
            key.path().to_str().unwrap(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_requires_tls_config_for_https() {
        let server = ProxyServer::new(crate::config::ListenConfig {
            port: 0,
            protocol: Protocol::Https,
            tls: None,
        })
        .unwrap();
        let err = server.run().await.unwrap_err();
        assert!(err.to_string().contains("TLS configuration required"));
    }
}
