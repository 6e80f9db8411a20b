//! TLS certificate material and rustls server configuration.
//!
//! # Responsibilities
//! - Load PEM certificate chains and private keys from disk
//! - Generate a throwaway self-signed certificate on request
//! - Build per-stack rustls configs (the TCP and QUIC listeners
//!   advertise different ALPN sets over the same identity)

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

use crate::config::TlsMaterial;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("could not open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("rejected certificate material: {0}")]
    Config(#[from] rustls::Error),
}

/// Certificate chain plus private key, independent of protocol stack.
/// The `Debug` form comes from the DER types, which redact key bytes.
#[derive(Debug)]
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Resolves configured material into a loaded identity.
    pub fn load(material: &TlsMaterial, hostname: &str) -> Result<Self, TlsError> {
        match material {
            TlsMaterial::Files { cert, key } => Ok(Self {
                certs: load_certs(cert)?,
                key: load_private_key(key)?,
            }),
            TlsMaterial::SelfSigned => Self::self_signed(hostname),
        }
    }

    /// Generates a self-signed certificate for `hostname`.
    pub fn self_signed(hostname: &str) -> Result<Self, TlsError> {
        tracing::info!(hostname, "generating self-signed certificate");
        let signed = rcgen::generate_simple_self_signed([hostname.to_string()])?;
        Ok(Self {
            certs: vec![signed.cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(signed.key_pair.serialize_der().into()),
        })
    }

    /// Builds a rustls server config advertising `alpn`.
    pub fn server_config(&self, alpn: &[&[u8]]) -> Result<rustls::ServerConfig, TlsError> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Ok(config)
    }
}

/// ALPN set for the TLS-over-TCP stack.
pub fn tcp_alpn(enable_http2: bool) -> &'static [&'static [u8]] {
    if enable_http2 {
        &[b"h2", b"http/1.1"]
    } else {
        &[b"http/1.1"]
    }
}

/// ALPN set for the QUIC stack.
pub const QUIC_ALPN: &[&[u8]] = &[b"h3"];

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs1(key))
            }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs8(key))
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                return Ok(PrivateKeyDer::Sec1(key))
            }
            // Certificates and other PEM blocks may precede the key.
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(source) => {
                return Err(TlsError::Parse {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    Err(TlsError::NoPrivateKey(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_identity_builds_server_configs() {
        let identity = TlsIdentity::self_signed("nq.test.example").unwrap();
        let tcp = identity.server_config(tcp_alpn(true)).unwrap();
        assert_eq!(tcp.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let quic = identity.server_config(QUIC_ALPN).unwrap();
        assert_eq!(quic.alpn_protocols, vec![b"h3".to_vec()]);
    }

    #[test]
    fn alpn_without_http2_is_http1_only() {
        assert_eq!(tcp_alpn(false), &[b"http/1.1".as_slice()]);
    }

    #[test]
    fn missing_cert_file_is_reported() {
        let material = TlsMaterial::Files {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        let err = TlsIdentity::load(&material, "nq.test.example").unwrap_err();
        assert!(matches!(err, TlsError::Open { .. }));
    }

    #[test]
    fn round_trip_generated_material_through_pem_files() {
        let signed = rcgen::generate_simple_self_signed(["nq.test.example".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("nq-tls-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, signed.cert.pem()).unwrap();
        std::fs::write(&key_path, signed.key_pair.serialize_pem()).unwrap();

        let material = TlsMaterial::Files {
            cert: cert_path,
            key: key_path,
        };
        let identity = TlsIdentity::load(&material, "nq.test.example").unwrap();
        identity.server_config(tcp_alpn(true)).unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
