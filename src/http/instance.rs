//! Per-listener serving state.
//!
//! Every (scheme, port) binding gets its own `ServerInstance` holding the
//! byte counters and the lazily built discovery document for that
//! listener. Handler tasks share it behind an `Arc`.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::config::{Binding, Scheme, ServerConfig};
use crate::counters::ByteCounters;
use crate::http::discovery::DiscoveryDocument;

pub struct ServerInstance {
    pub scheme: Scheme,
    /// Port clients are told to connect to; also the Alt-Svc target.
    pub public_port: u16,
    /// host[:port] form used when building discovery URLs.
    pub public_host_port: String,
    pub context_path: String,
    pub enable_cors: bool,
    /// Advertise the HTTP/3 listener on discovery responses.
    pub h3_alt_svc: bool,
    pub counters: Arc<ByteCounters>,
    discovery: OnceLock<Bytes>,
}

impl ServerInstance {
    pub fn new(config: &ServerConfig, binding: Binding) -> Self {
        Self {
            scheme: binding.scheme,
            public_port: binding.port,
            public_host_port: config.public_host_port(binding.port),
            context_path: config.context_path.clone(),
            enable_cors: config.enable_cors,
            h3_alt_svc: binding.scheme == Scheme::Https && config.enable_http3,
            counters: Arc::new(ByteCounters::new()),
            discovery: OnceLock::new(),
        }
    }

    /// The cached discovery document, built on first access.
    ///
    /// Concurrent first callers all block on the same generation and
    /// then share one immutable buffer; later reads are lock-free.
    pub fn discovery_document(&self) -> Bytes {
        self.discovery
            .get_or_init(|| {
                DiscoveryDocument::new(self.scheme, &self.public_host_port, &self.context_path)
                    .render()
            })
            .clone()
    }

    pub fn alt_svc(&self) -> Option<String> {
        self.h3_alt_svc
            .then(|| format!("h3=\":{}\"", self.public_port))
    }

    /// Operator-facing name for this listener, used in log fields.
    pub fn label(&self) -> String {
        format!("{}://{}", self.scheme, self.public_host_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsMaterial;

    fn https_instance() -> ServerInstance {
        let config = ServerConfig {
            tls: Some(TlsMaterial::SelfSigned),
            enable_http3: true,
            ..ServerConfig::default()
        };
        let binding = config.bindings()[0];
        ServerInstance::new(&config, binding)
    }

    #[test]
    fn discovery_document_is_generated_exactly_once() {
        let instance = Arc::new(https_instance());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let instance = Arc::clone(&instance);
            handles.push(std::thread::spawn(move || instance.discovery_document()));
        }

        let documents: Vec<Bytes> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = documents[0].as_ptr();
        // All callers must observe the same backing buffer.
        assert!(documents.iter().all(|d| d.as_ptr() == first));
    }

    #[test]
    fn alt_svc_advertises_the_public_port() {
        let instance = https_instance();
        assert_eq!(instance.alt_svc(), Some("h3=\":4043\"".to_string()));
    }

    #[test]
    fn alt_svc_absent_without_http3() {
        let config = ServerConfig {
            tls: Some(TlsMaterial::SelfSigned),
            ..ServerConfig::default()
        };
        let instance = ServerInstance::new(&config, config.bindings()[0]);
        assert_eq!(instance.alt_svc(), None);
    }

    #[test]
    fn plaintext_instance_never_advertises_h3() {
        let config = ServerConfig {
            enable_http3: true,
            ..ServerConfig::default()
        };
        let instance = ServerInstance::new(&config, config.bindings()[0]);
        assert_eq!(instance.scheme, Scheme::Http);
        assert_eq!(instance.alt_svc(), None);
    }
}
