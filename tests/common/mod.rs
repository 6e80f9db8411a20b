//! Shared utilities for integration tests.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use nqserver::config::ServerConfig;
use nqserver::lifecycle::Orchestrator;

/// Plaintext config bound to an ephemeral loopback port.
pub fn plain_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1".to_string(),
        insecure_public_port: 0,
        ..ServerConfig::default()
    }
}

/// Starts a server and returns it with its first bound address.
pub async fn start_server(config: ServerConfig) -> (Orchestrator, SocketAddr) {
    let orchestrator = Orchestrator::bind(&config)
        .await
        .expect("server should bind on loopback");
    let addr = orchestrator.endpoints()[0].addr;
    (orchestrator, addr)
}

/// A fully read HTTP/1.1 response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    #[allow(dead_code)]
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Writes one HTTP/1.1 request with `Connection: close`.
pub async fn send_request(stream: &mut TcpStream, method: &str, path: &str, body: &[u8]) {
    let head = format!(
        "{method} {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.expect("write head");
    stream.write_all(body).await.expect("write body");
}

/// Reads the status line and headers; returns any body bytes that were
/// already buffered behind them.
pub async fn read_head(stream: &mut TcpStream) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let split = loop {
        if let Some(pos) = find_blank_line(&buf) {
            break pos;
        }
        let n = stream.read(&mut chunk).await.expect("read response head");
        assert!(n > 0, "connection closed before the header block ended");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..split]).to_string();
    let leftover = buf[split + 4..].to_vec();

    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("unparseable status line {status_line:?}"));

    let headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();

    (status, headers, leftover)
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Reads until `total` body bytes are in hand, counting `leftover` first.
#[allow(dead_code)]
pub async fn read_body_exact(stream: &mut TcpStream, leftover: Vec<u8>, total: usize) -> Vec<u8> {
    let mut body = leftover;
    if body.len() >= total {
        body.truncate(total);
        return body;
    }
    let mut rest = vec![0u8; total - body.len()];
    stream.read_exact(&mut rest).await.expect("read body");
    body.append(&mut rest);
    body
}

/// One-shot request against `addr`, reading the response to EOF.
///
/// Not for the endless download endpoints; those need manual reads.
#[allow(dead_code)]
pub async fn request(addr: SocketAddr, method: &str, path: &str, body: &[u8]) -> Response {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    send_request(&mut stream, method, path, body).await;

    let (status, headers, leftover) = read_head(&mut stream).await;
    let mut body = leftover;
    stream.read_to_end(&mut body).await.expect("read body");
    Response {
        status,
        headers,
        body,
    }
}
