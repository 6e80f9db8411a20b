//! Serving units.
//!
//! # Responsibilities
//! - Run one accept loop per bound (scheme, port) protocol stack
//! - Own every connection the listener produces, so tearing down the unit
//!   tears down its connections
//! - Walk the lifecycle states one way: Created → Serving → ShuttingDown
//!   → Stopped
//!
//! # Design Decisions
//! - Shutdown is a watch flip observed by the accept loop and by every
//!   in-flight connection; hyper drains the connection, the unit joins it
//! - The accept loop reaps finished connections as it runs, so the set it
//!   owns holds only live connections when the drain starts
//! - Aborting the unit task drops its JoinSet, which closes every owned
//!   connection at once; the orchestrator uses that as the hard stop
//! - Peer disconnects mid-transfer are the normal end of a measurement
//!   and never logged above trace

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::Router;
use http::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;

use crate::net::is_disconnect;

/// How long a connection may sit idle before its request head arrives.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifecycle states a serving unit passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Created,
    Serving,
    ShuttingDown,
    Stopped,
}

/// Protocol stack spoken on a TCP listener.
#[derive(Clone)]
pub enum TcpStack {
    /// Plaintext HTTP/1.1 only.
    Http1,
    /// Cleartext HTTP/1.1 plus HTTP/2 with prior knowledge.
    H2c,
    /// TLS first, then HTTP/1.1 or (when offered via ALPN) HTTP/2.
    Tls { acceptor: TlsAcceptor, http2: bool },
}

impl TcpStack {
    pub fn label(&self) -> &'static str {
        match self {
            TcpStack::Http1 => "http/1.1",
            TcpStack::H2c => "h2c",
            TcpStack::Tls { .. } => "tls",
        }
    }
}

/// Handle to one spawned serving unit.
///
/// The unit task owns the listener and every connection accepted from it;
/// aborting the handle closes all of that at once.
pub struct ServingUnit {
    name: String,
    state: watch::Receiver<UnitState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServingUnit {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> UnitState {
        *self.state.borrow()
    }

    /// Ask the unit to stop accepting and drain in-flight connections.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits until the unit reports `Stopped`. Also returns if the unit
    /// task died, which cannot leave connections behind (the task owns
    /// them).
    pub async fn wait_stopped(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == UnitState::Stopped)
            .await;
    }

    /// Hard stop: closes the listener and every owned connection.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Joins the unit task.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            if !err.is_cancelled() {
                tracing::error!(unit = %self.name, error = %err, "serving unit task failed");
            }
        }
    }
}

/// Spawns a serving unit for one TCP listener.
pub fn spawn_tcp(name: String, stack: TcpStack, listener: TcpListener, router: Router) -> ServingUnit {
    let (state_tx, state_rx) = watch::channel(UnitState::Created);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let unit_name = name.clone();
    let task = tokio::spawn(async move {
        run_tcp(unit_name, stack, listener, router, state_tx, shutdown_rx).await;
    });
    ServingUnit {
        name,
        state: state_rx,
        shutdown: shutdown_tx,
        task,
    }
}

/// Spawns a serving unit for one QUIC endpoint speaking HTTP/3.
pub fn spawn_quic(name: String, endpoint: quinn::Endpoint, router: Router) -> ServingUnit {
    let (state_tx, state_rx) = watch::channel(UnitState::Created);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let unit_name = name.clone();
    let task = tokio::spawn(async move {
        run_quic(unit_name, endpoint, router, state_tx, shutdown_rx).await;
    });
    ServingUnit {
        name,
        state: state_rx,
        shutdown: shutdown_tx,
        task,
    }
}

async fn run_tcp(
    name: String,
    stack: TcpStack,
    listener: TcpListener,
    router: Router,
    state: watch::Sender<UnitState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    state.send_replace(UnitState::Serving);
    tracing::info!(unit = %name, "serving");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(unit = %name, error = %err, "accept failed");
                        continue;
                    }
                };
                disable_nagle(&name, &stream);
                let stack = stack.clone();
                let router = router.clone();
                let conn_shutdown = shutdown.clone();
                let _ = connections.spawn(async move {
                    serve_tcp_connection(stack, stream, peer, router, conn_shutdown).await;
                });
            }
            // Reap connections as they finish; the set must not grow with
            // every connection ever accepted.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    // Refuse new connections for the whole drain, not just after it.
    drop(listener);
    state.send_replace(UnitState::ShuttingDown);
    tracing::info!(unit = %name, connections = connections.len(), "draining");
    while connections.join_next().await.is_some() {}
    state.send_replace(UnitState::Stopped);
    tracing::info!(unit = %name, "stopped");
}

async fn run_quic(
    name: String,
    endpoint: quinn::Endpoint,
    router: Router,
    state: watch::Sender<UnitState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    state.send_replace(UnitState::Serving);
    tracing::info!(unit = %name, "serving");

    loop {
        tokio::select! {
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let router = router.clone();
                let conn_shutdown = shutdown.clone();
                let _ = connections.spawn(async move {
                    let connection = match incoming.await {
                        Ok(connection) => connection,
                        Err(err) => {
                            tracing::debug!(error = %err, "QUIC handshake failed");
                            return;
                        }
                    };
                    if let Err(err) =
                        crate::http::h3::serve_connection(connection, router, conn_shutdown).await
                    {
                        if crate::http::h3::is_peer_close(&err) {
                            tracing::trace!("h3 connection closed by peer");
                        } else {
                            tracing::debug!(error = %err, "h3 connection ended with error");
                        }
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    state.send_replace(UnitState::ShuttingDown);
    tracing::info!(unit = %name, connections = connections.len(), "draining");
    while connections.join_next().await.is_some() {}
    endpoint.close(0u32.into(), b"server shutdown");
    endpoint.wait_idle().await;
    state.send_replace(UnitState::Stopped);
    tracing::info!(unit = %name, "stopped");
}

/// Periodic responses end each burst with a sub-MSS tail; Nagle would hold
/// that tail behind unacked data for a round trip.
fn disable_nagle(name: &str, stream: &TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::warn!(unit = %name, error = %err, "set_nodelay failed");
    }
}

async fn serve_tcp_connection(
    stack: TcpStack,
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    shutdown: watch::Receiver<bool>,
) {
    match stack {
        TcpStack::Http1 => serve_h1(TokioIo::new(stream), peer, router, shutdown).await,
        TcpStack::H2c => serve_auto(TokioIo::new(stream), peer, router, shutdown).await,
        TcpStack::Tls { acceptor, http2 } => {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(peer = %peer, error = %err, "TLS handshake failed");
                    return;
                }
            };
            if http2 {
                serve_auto(TokioIo::new(stream), peer, router, shutdown).await;
            } else {
                serve_h1(TokioIo::new(stream), peer, router, shutdown).await;
            }
        }
    }
}

/// Serves one byte stream with the HTTP/1.1-only connection driver.
async fn serve_h1<I>(io: I, peer: SocketAddr, router: Router, mut shutdown: watch::Receiver<bool>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |request: Request<Incoming>| {
        router.clone().oneshot(request.map(Body::new))
    });
    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    finish_connection(peer, result.err().map(Into::into));
}

/// Serves one byte stream with the protocol-sniffing driver, which takes
/// both HTTP/1.1 and HTTP/2 (prior knowledge or ALPN-selected).
async fn serve_auto<I>(io: I, peer: SocketAddr, router: Router, mut shutdown: watch::Receiver<bool>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |request: Request<Incoming>| {
        router.clone().oneshot(request.map(Body::new))
    });
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    finish_connection(peer, result.err().map(Into::into));
}

/// Classifies how a connection ended. Peer-initiated teardown is how every
/// saturation test finishes and stays out of the logs.
fn finish_connection(peer: SocketAddr, err: Option<Box<dyn std::error::Error + Send + Sync>>) {
    match err {
        None => {}
        Some(err) if is_disconnect(err.as_ref()) => {
            tracing::trace!(peer = %peer, "peer closed mid-transfer");
        }
        Some(err) => {
            tracing::warn!(peer = %peer, error = %err, "connection ended with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Binding, Scheme, ServerConfig};
    use crate::http::ServerInstance;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing_subscriber::fmt::MakeWriter;

    async fn test_unit(stack: TcpStack) -> (ServingUnit, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig::default();
        let instance = Arc::new(ServerInstance::new(
            &config,
            Binding {
                scheme: Scheme::Http,
                port: addr.port(),
            },
        ));
        let router = crate::http::router(instance);
        let unit = spawn_tcp(format!("test@{addr}"), stack, listener, router);
        (unit, addr)
    }

    async fn wait_for_state(unit: &ServingUnit, target: UnitState) {
        for _ in 0..100 {
            if unit.state() == target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("unit never reached {target:?}, still {:?}", unit.state());
    }

    #[tokio::test]
    async fn unit_walks_the_lifecycle_states() {
        let (mut unit, _addr) = test_unit(TcpStack::Http1).await;
        wait_for_state(&unit, UnitState::Serving).await;

        unit.begin_shutdown();
        unit.wait_stopped().await;
        assert_eq!(unit.state(), UnitState::Stopped);
        unit.join().await;
    }

    #[tokio::test]
    async fn unit_serves_requests_until_shutdown() {
        let (mut unit, addr) = test_unit(TcpStack::Http1).await;
        wait_for_state(&unit, UnitState::Serving).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /small HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("content-length: 1"), "{response}");

        unit.begin_shutdown();
        unit.wait_stopped().await;
        unit.join().await;
    }

    #[tokio::test]
    async fn stopped_unit_refuses_connections() {
        let (mut unit, addr) = test_unit(TcpStack::Http1).await;
        wait_for_state(&unit, UnitState::Serving).await;

        unit.begin_shutdown();
        unit.wait_stopped().await;
        unit.join().await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    /// Collects formatted log lines so a test can assert on them.
    #[derive(Clone, Default)]
    struct LogSink(Arc<Mutex<Vec<u8>>>);

    impl LogSink {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogSink {
        type Writer = LogSink;

        fn make_writer(&'a self) -> LogSink {
            self.clone()
        }
    }

    #[tokio::test]
    async fn finished_connections_are_reaped_during_serving() {
        let sink = LogSink::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(sink.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (mut unit, addr) = test_unit(TcpStack::Http1).await;
        wait_for_state(&unit, UnitState::Serving).await;

        for _ in 0..5 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /small HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.unwrap();
        }
        // Let the accept loop observe the five finished connection tasks.
        tokio::time::sleep(Duration::from_millis(200)).await;

        unit.begin_shutdown();
        unit.wait_stopped().await;
        unit.join().await;

        let logs = sink.contents();
        let drain = logs
            .lines()
            .find(|line| line.contains("draining"))
            .expect("no drain log line");
        assert!(drain.contains("connections=0"), "{drain}");
    }

    #[tokio::test]
    async fn accepted_streams_run_with_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _peer) = listener.accept().await.unwrap();

        disable_nagle("test", &accepted);
        assert!(accepted.nodelay().unwrap());
    }
}
