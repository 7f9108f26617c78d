//! PinShare Server - Main Entry Point
//!
//! TCP listener for PIN rendezvous, optionally over TLS.

use anyhow::Result;
use clap::Parser;
use log::info;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::rustls::{self, pki_types::PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use pinshare::rendezvous::{self, RendezvousService};
use pinshare::ServerConfig;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "pinshare-server")]
#[command(about = "PinShare rendezvous server - pairs peers by one-time PIN")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override signaling port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (defaults to the config file's)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let (config, from_file) = if args.config.exists() {
        (ServerConfig::from_file(&args.config.to_string_lossy())?, true)
    } else {
        (ServerConfig::default(), false)
    };

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or(config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    if !from_file {
        info!("Config file not found, using defaults");
    }

    let host = args.host.unwrap_or(config.signaling_host.clone());
    let port = args.port.unwrap_or(config.signaling_port);

    // Configure TLS when a certificate and key are given
    let acceptor = match (&config.certfile, &config.keyfile) {
        (Some(certfile), Some(keyfile)) => {
            let certs = load_certs(certfile)?;
            let key = load_key(keyfile)?;
            let tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        _ => None,
    };

    let service = Arc::new(RendezvousService::in_memory(config.room_ttl()));
    let sweeper = rendezvous::spawn_sweeper(service.clone(), config.sweep_interval());

    // Bind TCP listener
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        "PinShare server listening on {}{}",
        addr,
        if acceptor.is_some() { " (TLS)" } else { "" }
    );

    tokio::select! {
        result = pinshare::server::serve(listener, service.clone(), acceptor, config.max_message_size) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    sweeper.abort();
    service.shutdown();
    Ok(())
}

/// Load TLS certificates
fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// Load TLS private key
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let keys = rustls_pemfile::private_key(&mut reader)?;
    keys.ok_or_else(|| anyhow::anyhow!("No private key found"))
}
