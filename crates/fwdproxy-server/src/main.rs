//! fwdproxy: HTTP/HTTPS forward proxy.
//!
//! Accepts client connections, reads the first request head to learn the
//! destination, connects to it, answers CONNECT with
//! `200 Connection established`, and relays bytes both ways until either
//! side closes.

mod config;
mod proxy;

use clap::Parser;
use config::{ServerConfig, DEFAULT_CONFIG_PATH};
use proxy::{DnsResolver, ProxyContext};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// fwdproxy — HTTP/HTTPS forward proxy
#[derive(Parser, Debug)]
#[command(name = "fwdproxy", version, about = "HTTP/HTTPS forward proxy")]
struct Cli {
    /// Config file path (created with defaults if missing)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Listen address (overrides the config file)
    #[arg(short, long)]
    address: Option<IpAddr>,

    /// Listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting fwdproxy");

    let server_config = match ServerConfig::load(&PathBuf::from(&cli.config), cli.address, cli.port)
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    info!(
        config = %server_config.config_path.display(),
        listen = %server_config.listen_addr(),
        "config loaded"
    );

    let ctx = Arc::new(ProxyContext::new(
        server_config.listen_addr(),
        Arc::new(DnsResolver),
    ));

    if let Err(e) = proxy::run(ctx, shutdown_signal()).await {
        error!(error = %e, "proxy error");
        std::process::exit(1);
    }

    info!("fwdproxy stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
