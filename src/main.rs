//! Network Quality Measurement Server
//!
//! Serves the endpoints responsiveness clients saturate a path with, plus
//! the discovery document that names them.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌───────────────────────────────────────────────┐
//!                        │              MEASUREMENT SERVER               │
//!                        │                                               │
//!    measurement client  │  ┌──────────┐   ┌───────────┐   ┌─────────┐  │
//!    ────────────────────┼─▶│   net    │──▶│ lifecycle │──▶│  http   │  │
//!    (one unit per       │  │  tuned   │   │  serving  │   │ router, │  │
//!     protocol stack)    │  │ listener │   │   units   │   │handlers │  │
//!                        │  └──────────┘   └───────────┘   └────┬────┘  │
//!                        │   h1 / h2c / TLS h1+h2 / h3 (QUIC)   │       │
//!                        │                                      ▼       │
//!                        │  ┌─────────────────────────────────────────┐ │
//!                        │  │ chunked + periodic streaming bodies     │ │
//!                        │  │ shared byte counters, discovery doc     │ │
//!                        │  └─────────────────────────────────────────┘ │
//!                        └───────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod counters;
pub mod lifecycle;

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{
    ServerConfig, SocketTuning, TlsMaterial, DEFAULT_CONFIG_NAME, DEFAULT_INSECURE_PUBLIC_PORT,
    DEFAULT_L4S_ALGORITHM, DEFAULT_SECURE_PUBLIC_PORT, DEFAULT_SHUTDOWN_GRACE,
};
use crate::lifecycle::{signals, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "nqserver", version, about = "Network quality measurement server")]
struct Args {
    /// Address to bind listeners on.
    #[arg(long, default_value = "localhost")]
    listen_addr: String,

    /// Port for HTTPS / HTTP3 measurement traffic.
    #[arg(long, default_value_t = DEFAULT_SECURE_PUBLIC_PORT)]
    public_port: u16,

    /// Port for plaintext HTTP measurement traffic (0 disables it; forced
    /// on when no TLS material is configured or with --enable-h2c).
    #[arg(long, default_value_t = 0)]
    insecure_public_port: u16,

    /// Hostname written into the discovery document.
    #[arg(long, default_value = DEFAULT_CONFIG_NAME)]
    config_name: String,

    /// Hostname clients should connect to; defaults to --config-name.
    #[arg(long, default_value = "")]
    public_name: String,

    /// Path prefix when serving behind a reverse proxy ("/prefix").
    #[arg(long, default_value = "")]
    context_path: String,

    /// TLS certificate chain file (PEM).
    #[arg(long, requires = "key_file")]
    cert_file: Option<PathBuf>,

    /// TLS private key file (PEM).
    #[arg(long, requires = "cert_file")]
    key_file: Option<PathBuf>,

    /// Generate a self-signed certificate instead of loading files.
    #[arg(long, conflicts_with_all = ["cert_file", "key_file"])]
    create_cert: bool,

    /// Attach permissive cross-origin headers to every response.
    #[arg(long)]
    enable_cors: bool,

    /// Serve cleartext HTTP/2 (prior knowledge) instead of TLS.
    #[arg(long)]
    enable_h2c: bool,

    /// Offer HTTP/2 over TLS.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_http2: bool,

    /// Additionally serve HTTP/3 over QUIC on the secure port.
    #[arg(long)]
    enable_http3: bool,

    /// Enable L4S congestion control with the default algorithm.
    #[arg(long)]
    enable_l4s: bool,

    /// Congestion control algorithm for the listening sockets.
    #[arg(long)]
    congestion: Option<String>,

    /// TCP_NOTSENT_LOWAT watermark in bytes (0 leaves the kernel default).
    #[arg(long, default_value_t = 0)]
    socket_send_buffer: u32,

    /// Traffic-class byte for listener sockets, decimal or 0x-hex
    /// (0 leaves the kernel default).
    #[arg(long, default_value_t = 0, value_parser = parse_tos)]
    tos: u8,

    /// Bound on the graceful shutdown drain, in seconds.
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE.as_secs())]
    shutdown_grace_secs: u64,

    /// Verbose logging plus the per-second throughput report.
    #[arg(long)]
    debug: bool,
}

/// Accepts decimal ("46") and hex ("0x2e") traffic-class values.
fn parse_tos(raw: &str) -> Result<u8, std::num::ParseIntError> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        raw.parse()
    }
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let tls = if self.create_cert {
            Some(TlsMaterial::SelfSigned)
        } else {
            match (self.cert_file, self.key_file) {
                (Some(cert), Some(key)) => Some(TlsMaterial::Files { cert, key }),
                _ => None,
            }
        };

        // H2C and missing TLS material both force the plaintext port on.
        let insecure_public_port = if self.enable_h2c || tls.is_none() {
            if self.insecure_public_port > 0 {
                self.insecure_public_port
            } else {
                DEFAULT_INSECURE_PUBLIC_PORT
            }
        } else {
            self.insecure_public_port
        };

        let congestion = self
            .congestion
            .or_else(|| self.enable_l4s.then(|| DEFAULT_L4S_ALGORITHM.to_string()));

        ServerConfig {
            listen_addr: self.listen_addr,
            public_port: self.public_port,
            insecure_public_port,
            config_name: self.config_name,
            public_name: self.public_name,
            context_path: self.context_path,
            tls,
            enable_cors: self.enable_cors,
            enable_h2c: self.enable_h2c,
            enable_http2: self.enable_http2,
            enable_http3: self.enable_http3,
            tuning: SocketTuning {
                send_lowat: (self.socket_send_buffer > 0).then_some(self.socket_send_buffer),
                congestion,
                tos: (self.tos > 0).then_some(self.tos),
            },
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            debug: self.debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "nqserver=debug,tower_http=debug"
    } else {
        "nqserver=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "nqserver starting");

    // rustls wants one process-wide crypto provider before any TLS or
    // QUIC config is built.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = args.into_config();
    if let Err(errors) = config::validate(&config) {
        for error in &errors {
            tracing::error!(%error, "invalid configuration");
        }
        return Err("configuration rejected".into());
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        config_name = %config.config_name,
        h2c = config.enable_h2c,
        http3 = config.enable_http3,
        "Configuration loaded"
    );

    let orchestrator = Orchestrator::bind(&config).await?;

    signals::terminated().await;
    tracing::info!("shutdown signal received");

    tokio::select! {
        () = orchestrator.shutdown(config.shutdown_grace) => {
            tracing::info!("Shutdown complete");
        }
        () = signals::terminated() => {
            tracing::warn!("second signal received, abandoning drain");
        }
    }

    Ok(())
}
