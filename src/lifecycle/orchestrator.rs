//! Listener orchestration and coordinated shutdown.
//!
//! # Responsibilities
//! - Resolve and bind every configured (scheme, port) pair with the socket
//!   tunables applied
//! - Wrap listeners in their protocol stacks (plain, H2C, TLS, QUIC) and
//!   spawn one serving unit per stack
//! - Drive the bounded graceful shutdown across all units
//!
//! # Design Decisions
//! - TLS material is loaded once and shared; the TCP and QUIC stacks get
//!   separate rustls configs because their ALPN sets differ
//! - The HTTP/3 unit shares the TLS binding's instance and router, so both
//!   stacks feed the same counters and discovery document
//! - Shutdown has one deadline for all units; stragglers are aborted,
//!   which closes their connections outright

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicServerConfig;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsAcceptor;

use crate::config::{Binding, Scheme, ServerConfig};
use crate::counters;
use crate::http::{self, ServerInstance};
use crate::net::listener::{self, ListenerError};
use crate::net::tls::{self, TlsError, TlsIdentity};

use super::unit::{self, ServingUnit, TcpStack};

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("QUIC crypto setup failed: {0}")]
    QuicCrypto(#[from] quinn::crypto::rustls::NoInitialCipherSuite),

    #[error("could not bind UDP {addr}: {source}")]
    QuicBind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("https binding requires TLS material")]
    MissingTlsMaterial,
}

/// One bound address together with the state its handlers share.
pub struct BoundEndpoint {
    pub scheme: Scheme,
    pub addr: SocketAddr,
    pub instance: Arc<ServerInstance>,
}

/// Owns every serving unit of one server process.
pub struct Orchestrator {
    units: Vec<ServingUnit>,
    endpoints: Vec<BoundEndpoint>,
    samplers: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Binds every configured (scheme, port) pair and starts serving.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServeError> {
        let identity = match &config.tls {
            Some(material) => Some(TlsIdentity::load(
                material,
                config.effective_public_name(),
            )?),
            None => None,
        };

        let mut units = Vec::new();
        let mut endpoints = Vec::new();
        let mut samplers = Vec::new();

        for binding in config.bindings() {
            let addr = listener::resolve(&config.listen_addr, binding.port).await?;
            let tcp = listener::bind_tcp(addr, &config.tuning)?;
            let local_addr = tcp
                .local_addr()
                .map_err(|source| ListenerError::Bind { addr, source })?;

            // An ephemeral port request resolves here; the discovery
            // document must name the port clients can actually reach.
            let bound = Binding {
                scheme: binding.scheme,
                port: local_addr.port(),
            };
            let instance = Arc::new(ServerInstance::new(config, bound));
            let router = http::router(Arc::clone(&instance));

            match binding.scheme {
                Scheme::Http => {
                    let stack = if config.enable_h2c {
                        TcpStack::H2c
                    } else {
                        TcpStack::Http1
                    };
                    let name = format!("{}@{}", stack.label(), local_addr);
                    units.push(unit::spawn_tcp(name, stack, tcp, router));
                }
                Scheme::Https => {
                    let Some(identity) = identity.as_ref() else {
                        return Err(ServeError::MissingTlsMaterial);
                    };
                    let acceptor = TlsAcceptor::from(Arc::new(
                        identity.server_config(tls::tcp_alpn(config.enable_http2))?,
                    ));
                    let stack = TcpStack::Tls {
                        acceptor,
                        http2: config.enable_http2,
                    };
                    let name = format!("{}@{}", stack.label(), local_addr);
                    units.push(unit::spawn_tcp(name, stack, tcp, router.clone()));

                    if config.enable_http3 {
                        let crypto =
                            QuicServerConfig::try_from(identity.server_config(tls::QUIC_ALPN)?)?;
                        let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
                        let endpoint = quinn::Endpoint::server(server_config, local_addr)
                            .map_err(|source| ServeError::QuicBind {
                                addr: local_addr,
                                source,
                            })?;
                        units.push(unit::spawn_quic(
                            format!("h3@{local_addr}"),
                            endpoint,
                            router,
                        ));
                    }
                }
            }

            if config.debug {
                samplers.push(counters::spawn_throughput_sampler(
                    instance.label(),
                    Arc::clone(&instance.counters),
                ));
            }

            let url = format!(
                "{}://{}{}/.well-known/nq",
                binding.scheme,
                config.public_host_port(bound.port),
                config.context_path
            );
            tracing::info!(%url, "network quality endpoint ready");

            endpoints.push(BoundEndpoint {
                scheme: binding.scheme,
                addr: local_addr,
                instance,
            });
        }

        Ok(Self {
            units,
            endpoints,
            samplers,
        })
    }

    /// The bound addresses, in configuration order.
    pub fn endpoints(&self) -> &[BoundEndpoint] {
        &self.endpoints
    }

    /// The running serving units.
    pub fn units(&self) -> &[ServingUnit] {
        &self.units
    }

    /// Graceful shutdown bounded by `grace`.
    ///
    /// Every unit stops accepting immediately; in-flight connections get
    /// until the shared deadline to finish, then are closed outright.
    pub async fn shutdown(mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        tracing::info!(grace_secs = grace.as_secs(), "shutting down");

        for sampler in self.samplers.drain(..) {
            sampler.abort();
        }
        for unit in &self.units {
            unit.begin_shutdown();
        }
        for mut unit in self.units.drain(..) {
            if timeout_at(deadline, unit.wait_stopped()).await.is_err() {
                tracing::warn!(unit = %unit.name(), "grace period expired, closing connections");
                unit.abort();
            }
            unit.join().await;
        }
        tracing::info!("all serving units stopped");
    }
}
