use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use anyrelay::{Proxy, ProxyConfig, TransportKind};

const DEFAULT_LOCAL_ADDR: &str = "localhost:9999";
const DEFAULT_REMOTE_ADDR: &str = "127.0.0.1:5201";

/// Relay byte streams between TCP, QUIC and WebSocket.
#[derive(Parser, Debug)]
#[command(name = "anyrelay", version, about = "Relay byte streams between TCP, QUIC and WebSocket")]
struct Args {
    /// Config file path (toml); flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local address to listen on [default: localhost:9999]
    #[arg(short = 'l', long = "local")]
    local: Option<String>,

    /// Remote address to proxy to [default: 127.0.0.1:5201]
    #[arg(short = 'r', long = "remote")]
    remote: Option<String>,

    /// Listen protocol: tcp, quic or ws [default: tcp]
    #[arg(short = 'p', long = "listen-protocol")]
    listen: Option<TransportKind>,

    /// Remote protocol: tcp, quic or ws [default: tcp]
    #[arg(short = 'u', long = "remote-protocol")]
    upstream: Option<TransportKind>,

    /// WebSocket path accepted and dialed [default: /]
    #[arg(long)]
    ws_path: Option<String>,

    /// PEM certificate chain for the QUIC listener
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key for the QUIC listener
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Verify the remote QUIC certificate against WebPKI roots
    #[arg(long)]
    verify_peer: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::from_toml_file(path)?,
            None => ProxyConfig::new(DEFAULT_LOCAL_ADDR, DEFAULT_REMOTE_ADDR, TransportKind::Tcp, TransportKind::Tcp),
        };

        if let Some(local) = self.local {
            config.local_addr = local;
        }
        if let Some(remote) = self.remote {
            config.remote_addr = remote;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(upstream) = self.upstream {
            config.remote = upstream;
        }
        if let Some(path) = self.ws_path {
            config.ws_path = path;
        }
        if self.cert.is_some() {
            config.quic.cert_pem_path = self.cert;
            config.quic.key_pem_path = self.key;
        }
        if self.verify_peer {
            config.quic.verify_certificate = true;
        }
        Ok(config)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = args.into_config().context("failed to load configuration")?;
    let banner = format!(
        "Listening: {} {}  {}\nProxying: {}\n",
        config.listen, config.remote, config.local_addr, config.remote_addr
    );

    let proxy = Proxy::bind(config).await.context("failed to start proxy")?;
    println!("{}", banner);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("[STOP] Ctrl-C received");
                signal.cancel();
            }
            Err(e) => tracing::warn!("[STOP] Failed to listen for Ctrl-C: {}", e),
        }
    });

    proxy.run_with_shutdown(shutdown).await?;
    Ok(())
}
