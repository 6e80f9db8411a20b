//! Discovery document served to measurement clients.
//!
//! Clients fetch this JSON once, then hit the URLs it names. The key set
//! is duplicated under generic and `https_`-prefixed names for older
//! clients; both sets point at the same endpoints.

use bytes::Bytes;
use serde::Serialize;

use crate::config::Scheme;

/// Format version clients use to detect incompatible servers.
pub const DISCOVERY_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct DiscoveryUrls {
    small_download_url: String,
    large_download_url: String,
    upload_url: String,
    small_https_download_url: String,
    large_https_download_url: String,
    https_upload_url: String,
    https_periodic_url: String,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryDocument {
    version: u32,
    urls: DiscoveryUrls,
}

impl DiscoveryDocument {
    pub fn new(scheme: Scheme, public_host_port: &str, context_path: &str) -> Self {
        let endpoint =
            |path: &str| format!("{scheme}://{public_host_port}{context_path}/{path}");

        Self {
            version: DISCOVERY_VERSION,
            urls: DiscoveryUrls {
                small_download_url: endpoint("small"),
                large_download_url: endpoint("large"),
                upload_url: endpoint("slurp"),
                small_https_download_url: endpoint("small"),
                large_https_download_url: endpoint("large"),
                https_upload_url: endpoint("slurp"),
                https_periodic_url: endpoint("periodic"),
            },
        }
    }

    /// Serializes with four-space indentation, the layout clients and
    /// operators already see in the wild.
    pub fn render(&self) -> Bytes {
        let mut buf = Vec::with_capacity(1024);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)
            .expect("discovery document serializes");
        Bytes::from(buf)
    }
}
