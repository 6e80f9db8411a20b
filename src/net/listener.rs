//! Tuned TCP listener construction.
//!
//! # Responsibilities
//! - Resolve the configured listen address
//! - Build the listening socket by hand so tunables land before `listen()`
//! - Hand back a tokio listener ready for the accept loop
//!
//! # Design Decisions
//! - socket2 drives the socket lifecycle; tuning happens between
//!   `socket()` and `listen()` so every accepted socket inherits it
//! - Bind failures carry the resolved address for the operator

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::SocketTuning;
use crate::net::tuning::{self, TuningError};

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("could not resolve listen address {addr:?}: {source}")]
    Resolve {
        addr: String,
        source: std::io::Error,
    },

    #[error("listen address {addr:?} resolved to nothing")]
    NoAddresses { addr: String },

    #[error(transparent)]
    Tuning(#[from] TuningError),

    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Resolves `host:port` to the first usable socket address.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ListenerError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ListenerError::Resolve {
            addr: format!("{host}:{port}"),
            source,
        })?;
    addrs.next().ok_or_else(|| ListenerError::NoAddresses {
        addr: format!("{host}:{port}"),
    })
}

/// Binds a TCP listener on `addr` with `tuning` applied before `listen()`.
pub fn bind_tcp(addr: SocketAddr, tuning: &SocketTuning) -> Result<TcpListener, ListenerError> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let bind = |source| ListenerError::Bind { addr, source };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind)?;
    socket.set_reuse_address(true).map_err(bind)?;

    tuning::apply(&socket, &addr, tuning)?;

    socket.bind(&addr.into()).map_err(bind)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind)?;
    socket.set_nonblocking(true).map_err(bind)?;

    let listener = TcpListener::from_std(socket.into()).map_err(bind)?;
    let local_addr = listener.local_addr().map_err(bind)?;

    tracing::debug!(address = %local_addr, "listener bound");

    Ok(listener)
}
