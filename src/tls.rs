//! TLS capabilities: the socket factory the pool compares by instance
//! identity, the hostname verifier callback, and a rustls-backed default
//! factory.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rustls::pki_types::ServerName;

use crate::Result;
use crate::error::Error;

/// Byte stream a connection runs on once established: either the raw TCP
/// socket or its TLS wrapper.
pub trait IoStream: Read + Write + Send {}

impl<T: Read + Write + Send> IoStream for T {}

/// Protocol ceiling for a handshake attempt. `Compat` is the one-time
/// fallback used after a `Modern` handshake failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsMode {
    Modern,
    Compat,
}

/// Capability that upgrades an established socket to TLS.
///
/// The connection pool compares factories by `Arc` identity, not by
/// configuration: swapping the factory instance mid-session must force a
/// fresh handshake rather than silently reusing a pooled socket.
pub trait TlsFactory: Send + Sync {
    fn handshake(&self, tcp: TcpStream, host: &str, mode: TlsMode) -> Result<Box<dyn IoStream>>;
}

/// Post-handshake hostname acceptance callback. Certificates are the peer's
/// DER-encoded chain, leaf first.
pub trait HostnameVerifier: Send + Sync {
    fn verify(&self, host: &str, peer_certificates: &[Vec<u8>]) -> bool;
}

/// Verifier that accepts whatever the TLS layer already validated.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptTlsVerified;

impl HostnameVerifier for AcceptTlsVerified {
    fn verify(&self, _host: &str, _peer_certificates: &[Vec<u8>]) -> bool {
        true
    }
}

/// Default factory: rustls with the webpki root set. `Modern` negotiates
/// TLS 1.3/1.2, `Compat` caps the handshake at TLS 1.2.
pub struct RustlsFactory {
    modern: Arc<rustls::ClientConfig>,
    compat: Arc<rustls::ClientConfig>,
    verifier: Arc<dyn HostnameVerifier>,
}

impl RustlsFactory {
    pub fn new() -> Result<Self> {
        Self::with_verifier(Arc::new(AcceptTlsVerified))
    }

    pub fn with_verifier(verifier: Arc<dyn HostnameVerifier>) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let modern = Self::config(
            roots.clone(),
            &[&rustls::version::TLS13, &rustls::version::TLS12],
        )?;
        let compat = Self::config(roots, &[&rustls::version::TLS12])?;
        Ok(Self {
            modern: Arc::new(modern),
            compat: Arc::new(compat),
            verifier,
        })
    }

    fn config(
        roots: rustls::RootCertStore,
        versions: &[&'static rustls::SupportedProtocolVersion],
    ) -> Result<rustls::ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)
            .map(|builder| builder.with_root_certificates(roots).with_no_client_auth())
            .map_err(|error| Error::tls("<config>", error.to_string()))
    }
}

impl TlsFactory for RustlsFactory {
    fn handshake(&self, tcp: TcpStream, host: &str, mode: TlsMode) -> Result<Box<dyn IoStream>> {
        let config = match mode {
            TlsMode::Modern => Arc::clone(&self.modern),
            TlsMode::Compat => Arc::clone(&self.compat),
        };
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|error| Error::tls(host, error.to_string()))?;
        let connection = rustls::ClientConnection::new(config, server_name)
            .map_err(|error| Error::tls(host, error.to_string()))?;
        let mut stream = rustls::StreamOwned::new(connection, tcp);

        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|error| Error::tls(host, error.to_string()))?;
        }

        let peer_certificates: Vec<Vec<u8>> = stream
            .conn
            .peer_certificates()
            .map(|certificates| {
                certificates
                    .iter()
                    .map(|certificate| certificate.as_ref().to_vec())
                    .collect()
            })
            .unwrap_or_default();
        if !self.verifier.verify(host, &peer_certificates) {
            return Err(Error::tls(host, "hostname verifier rejected the peer"));
        }

        Ok(Box::new(stream))
    }
}
