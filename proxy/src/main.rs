//! Passage Proxy
//!
//! A forwarding proxy for clients that need to reach the web through a
//! single authenticated hop.
//!
//! The proxy serves:
//! - CONNECT tunnels (opaque byte pipes, usually carrying HTTPS)
//! - Plain HTTP requests, forwarded to their origin
//!
//! Every request must carry the configured `Proxy-Authorization` Basic
//! credential. The listener speaks plaintext HTTP or terminates TLS itself.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod error;
mod proxy;

use config::{Config, Protocol};
use proxy::{Dispatcher, ForwardEngine, ProxyCredential, ProxyServer, TunnelEngine};

#[derive(Parser, Debug)]
#[command(name = "passage")]
#[command(author, version, about = "Authenticating HTTP/HTTPS forwarding proxy")]
struct Cli {
    /// Config file (defaults to config.toml in the platform config directory)
    #[arg(short, long, env = "PASSAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Protocol to listen for
    #[arg(long, value_enum)]
    proto: Option<Protocol>,

    /// Address to bind
    #[arg(long)]
    address: Option<IpAddr>,

    /// Port for the proxy to bind
    #[arg(short, long)]
    port: Option<u16>,

    /// Certificate PEM file for the TLS listener
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Private key PEM file for the TLS listener
    #[arg(long)]
    key: Option<PathBuf>,

    /// Username clients authenticate with
    #[arg(short, long, env = "PASSAGE_USERNAME")]
    username: Option<String>,

    /// Password clients authenticate with
    #[arg(long, env = "PASSAGE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Seconds to wait when dialing a tunnel target or origin
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Flags take precedence over the config file.
    fn apply(self, config: &mut Config) {
        if let Some(proto) = self.proto {
            config.listener.protocol = proto;
        }
        if let Some(address) = self.address {
            config.listener.address = address;
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(cert) = self.cert {
            config.listener.cert = cert;
        }
        if let Some(key) = self.key {
            config.listener.key = key;
        }
        if let Some(username) = self.username {
            config.auth.username = username;
        }
        if let Some(password) = self.password {
            config.auth.password = password;
        }
        if let Some(secs) = self.connect_timeout {
            config.upstream.connect_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let tls = match config.listener.protocol {
        Protocol::Https => Some(proxy::tls::load_acceptor(
            &config.listener.cert,
            &config.listener.key,
        )?),
        Protocol::Http => None,
    };

    let credential = ProxyCredential::new(&config.auth.username, &config.auth.password);
    info!("Clients authenticate as '{}'", credential.username());

    let dispatcher = Dispatcher::new(
        credential,
        TunnelEngine::new(config.connect_timeout()),
        ForwardEngine::new(
            config.upstream.pool_max_idle_per_host,
            config.connect_timeout(),
        )?,
    );

    let server = ProxyServer::bind(
        config.listen_addr(),
        tls,
        dispatcher,
        config.header_read_timeout(),
    )
    .await
    .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;

    info!(
        "passage {} listening on {}",
        config.listener.protocol,
        server.local_addr()?
    );

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await;

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
