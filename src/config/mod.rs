//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! command-line flags
//!     → main.rs (clap parse)
//!     → ServerConfig (plain data, defaults mirror the flag defaults)
//!     → validation.rs (semantic checks)
//!     → bindings() derives the (scheme, port) pairs to listen on
//! ```
//!
//! # Design Decisions
//! - Config is immutable once validated; there is no reload
//! - TLS material is a source (files or self-signed), resolved at startup
//! - Socket tunables are all optional; an omitted tunable is never applied

pub mod validation;

pub use validation::{validate, ConfigError};

use std::path::PathBuf;
use std::time::Duration;

/// Default port for plaintext (HTTP / H2C) measurement traffic.
pub const DEFAULT_INSECURE_PUBLIC_PORT: u16 = 4080;

/// Default port for HTTPS / HTTP3 measurement traffic.
pub const DEFAULT_SECURE_PUBLIC_PORT: u16 = 4043;

/// Congestion control algorithm selected by `--enable-l4s`.
pub const DEFAULT_L4S_ALGORITHM: &str = "prague";

/// Default hostname used in the discovery document.
pub const DEFAULT_CONFIG_NAME: &str = "networkquality.example.com";

/// Default bound on the graceful shutdown drain.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// URL scheme a listener serves, which also selects its protocol stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

/// A (scheme, port) pair the orchestrator binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub scheme: Scheme,
    pub port: u16,
}

/// Where TLS certificate and key material comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMaterial {
    /// PEM files supplied by the operator.
    Files { cert: PathBuf, key: PathBuf },
    /// Generate a throwaway self-signed certificate at startup.
    SelfSigned,
}

/// Optional per-listener kernel socket tunables.
///
/// Each tunable is applied to the listening socket before `listen()`; an
/// accepted socket inherits them. `None` means "leave the kernel default",
/// which succeeds on every platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketTuning {
    /// `TCP_NOTSENT_LOWAT`: cap unsent data buffered below the socket,
    /// so congestion shows up in measurements instead of in kernel queues.
    pub send_lowat: Option<u32>,

    /// `TCP_CONGESTION`: congestion control algorithm override.
    pub congestion: Option<String>,

    /// `IP_TOS` / `IPV6_TCLASS`: traffic-class byte for outgoing packets.
    pub tos: Option<u8>,
}

impl SocketTuning {
    /// True when no tunable was requested at all.
    pub fn is_noop(&self) -> bool {
        self.send_lowat.is_none() && self.congestion.is_none() && self.tos.is_none()
    }
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind listeners on.
    pub listen_addr: String,

    /// Port for HTTPS / H2C / HTTP3 measurement traffic.
    pub public_port: u16,

    /// Port for plaintext HTTP measurement traffic. With TLS material
    /// present, 0 leaves the plaintext stack off; without it, this is the
    /// only port served (the flag layer substitutes the default).
    pub insecure_public_port: u16,

    /// Hostname written into the discovery document.
    pub config_name: String,

    /// Hostname clients should connect to; defaults to `config_name`.
    pub public_name: String,

    /// Path prefix when serving behind a reverse proxy ("" or "/prefix").
    pub context_path: String,

    /// TLS material source; `None` serves plaintext only.
    pub tls: Option<TlsMaterial>,

    /// Attach permissive cross-origin headers to every response.
    pub enable_cors: bool,

    /// Accept cleartext HTTP/2 (prior knowledge) on the plaintext port.
    pub enable_h2c: bool,

    /// Offer HTTP/2 over TLS.
    pub enable_http2: bool,

    /// Additionally serve HTTP/3 over QUIC on the secure port.
    pub enable_http3: bool,

    /// Kernel socket tunables for the TCP listeners.
    pub tuning: SocketTuning,

    /// How long the orchestrator waits for in-flight work on shutdown.
    pub shutdown_grace: Duration,

    /// Verbose logging plus the 1 Hz throughput sampler.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "localhost".to_string(),
            public_port: DEFAULT_SECURE_PUBLIC_PORT,
            insecure_public_port: DEFAULT_INSECURE_PUBLIC_PORT,
            config_name: DEFAULT_CONFIG_NAME.to_string(),
            public_name: String::new(),
            context_path: String::new(),
            tls: None,
            enable_cors: false,
            enable_h2c: false,
            enable_http2: true,
            enable_http3: false,
            tuning: SocketTuning::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Hostname clients should use, falling back to the discovery hostname.
    pub fn effective_public_name(&self) -> &str {
        if self.public_name.is_empty() {
            &self.config_name
        } else {
            &self.public_name
        }
    }

    /// The (scheme, port) pairs this configuration serves.
    ///
    /// Without TLS material (or with H2C requested) everything runs on one
    /// plaintext port. With TLS, the secure port always serves and the
    /// plaintext port is added only when explicitly configured. Port 0
    /// binds ephemerally, which tests lean on.
    pub fn bindings(&self) -> Vec<Binding> {
        if self.enable_h2c || self.tls.is_none() {
            return vec![Binding {
                scheme: Scheme::Http,
                port: self.insecure_public_port,
            }];
        }

        let mut bindings = vec![Binding {
            scheme: Scheme::Https,
            port: self.public_port,
        }];
        if self.insecure_public_port > 0 {
            bindings.push(Binding {
                scheme: Scheme::Http,
                port: self.insecure_public_port,
            });
        }
        bindings
    }

    /// host[:port] clients use to reach `binding`, eliding well-known ports.
    pub fn public_host_port(&self, port: u16) -> String {
        if port == 80 || port == 443 {
            self.effective_public_name().to_string()
        } else {
            format!("{}:{}", self.effective_public_name(), port)
        }
    }
}
