use anyhow::anyhow;
use burrow_proxy::config::{ListenConfig, Protocol, TlsConfig};
use burrow_proxy::proxy::ProxyServer;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "burrow-proxy")]
#[command(about = "Forward HTTP proxy with CONNECT tunneling")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8888")]
    port: u16,
    /// Path to TLS certificate file (PEM)
    #[arg(long, default_value = "server.crt")]
    cert: String,
    /// Path to TLS private key file (PEM)
    #[arg(long, default_value = "server.key")]
    key: String,
    /// Listener protocol (http or https)
    #[arg(long, default_value = "https")]
    proto: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // An unknown protocol is a fatal startup error, before any bind.
    let protocol = Protocol::from_scheme(&args.proto).map_err(|e| anyhow!(e))?;

    let tls = match protocol {
        Protocol::Https => Some(TlsConfig {
            cert_path: args.cert,
            key_path: args.key,
        }),
        Protocol::Http => None,
    };

    let server = ProxyServer::new(ListenConfig {
        port: args.port,
        protocol,
        tls,
    })?;

    server.run().await
}
