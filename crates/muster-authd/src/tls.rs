//! TLS context construction and client certificate checks.
//!
//! One process-wide [`rustls::ServerConfig`] is built at startup from the
//! configured PEM material and stays immutable for the daemon's lifetime;
//! dispatch derives per-connection sessions from it through the
//! [`TlsAcceptor`]. When an agent CA bundle is configured, client
//! certificates are requested and verified against it during the handshake;
//! [`verify_peer_host`] optionally checks afterwards that the presented
//! certificate actually names the address the agent connected from.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use muster_core::config::TlsSection;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// TLS setup and verification errors.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Failed to read a PEM file.
    #[error("failed to read PEM file {path}: {source}")]
    Io {
        /// Path of the PEM file.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A certificate file contained no certificates.
    #[error("no certificates found in PEM file: {0}")]
    EmptyCertChain(String),

    /// A key file contained no private key.
    #[error("no private key found in PEM file: {0}")]
    EmptyPrivateKey(String),

    /// The configured minimum TLS version is not supported.
    #[error("invalid minimum TLS version: {0}")]
    InvalidMinVersion(String),

    /// rustls rejected the configuration.
    #[error("TLS config error: {0}")]
    Config(String),

    /// The peer presented no certificate when one was required.
    #[error("client presented no certificate")]
    NoPeerCertificate,

    /// The peer certificate could not be parsed.
    #[error("client certificate could not be parsed")]
    BadCertificate,

    /// The peer certificate names none of the expected addresses.
    #[error("client certificate does not match source address {ip}")]
    HostMismatch {
        /// The agent's source address.
        ip: String,
    },
}

impl TlsError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Builds the process-wide TLS acceptor from the configured material.
///
/// # Errors
///
/// Returns [`TlsError`] when PEM material cannot be loaded or rustls
/// rejects the resulting configuration. This is a fatal startup error.
pub fn build_acceptor(tls: &TlsSection) -> Result<TlsAcceptor, TlsError> {
    let cert_chain = load_cert_chain(&tls.server_cert)?;
    let key = load_private_key(&tls.server_key)?;
    let versions = resolve_tls_versions(&tls.min_version)?;

    let builder = ServerConfig::builder_with_protocol_versions(&versions);

    let server_config = if let Some(ca_path) = &tls.agent_ca {
        let ca_certs = load_cert_chain(ca_path)?;
        let mut roots = RootCertStore::empty();
        let _ = roots.add_parsable_certificates(ca_certs);
        let verifier = WebPkiClientVerifier::builder(roots.into())
            .build()
            .map_err(|e| TlsError::Config(e.to_string()))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)
            .map_err(|e| TlsError::Config(e.to_string()))?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| TlsError::Config(e.to_string()))?
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Checks that the verified client certificate names the address the agent
/// connected from, by SAN (IP or DNS entries) or subject CN.
///
/// # Errors
///
/// Returns [`TlsError`] when no certificate was presented, the certificate
/// cannot be parsed, or no identity matches the source address.
pub fn verify_peer_host(conn: &rustls::ServerConnection, ip: &str) -> Result<(), TlsError> {
    let certs = conn
        .peer_certificates()
        .filter(|certs| !certs.is_empty())
        .ok_or(TlsError::NoPeerCertificate)?;

    let identities = extract_identities(&certs[0])?;
    if identities.iter().any(|identity| identity == ip) {
        Ok(())
    } else {
        Err(TlsError::HostMismatch { ip: ip.to_string() })
    }
}

fn resolve_tls_versions(
    min_version: &str,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsError> {
    match min_version.trim() {
        "1.2" => Ok(vec![&rustls::version::TLS13, &rustls::version::TLS12]),
        "1.3" => Ok(vec![&rustls::version::TLS13]),
        other => Err(TlsError::InvalidMinVersion(other.to_string())),
    }
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path).map_err(|e| TlsError::io(path, e))?,
    );
    let cert_chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::io(path, e))?;
    if cert_chain.is_empty() {
        return Err(TlsError::EmptyCertChain(path.display().to_string()));
    }
    Ok(cert_chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path).map_err(|e| TlsError::io(path, e))?,
    );
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::io(path, e))?
        .ok_or_else(|| TlsError::EmptyPrivateKey(path.display().to_string()))?;
    Ok(key)
}

/// Pulls every identity a certificate claims: SAN DNS names, SAN IP
/// addresses, and subject common names.
fn extract_identities(cert: &CertificateDer<'_>) -> Result<Vec<String>, TlsError> {
    let (_, parsed) =
        X509Certificate::from_der(cert.as_ref()).map_err(|_| TlsError::BadCertificate)?;
    let mut identities = Vec::new();

    let san = parsed
        .subject_alternative_name()
        .map_err(|_| TlsError::BadCertificate)?;
    if let Some(san) = san {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => identities.push((*dns).to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_octets(bytes) {
                        identities.push(ip.to_string());
                    }
                },
                _ => {},
            }
        }
    }

    for cn in parsed.subject().iter_common_name() {
        if let Ok(cn) = cn.as_str() {
            identities.push(cn.to_string());
        }
    }

    Ok(identities)
}

fn ip_from_octets(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let array: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(array))
        },
        16 => {
            let array: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(array))
        },
        _ => None,
    }
}
