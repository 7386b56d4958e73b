//! Byte-stream transport for sessions
//!
//! This module provides the transport abstraction the session opens
//! connections through, plus a TCP implementation with optional TLS.

use crate::config::Endpoint;
use async_trait::async_trait;
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// An ordered, reliable byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Transport trait for opening stream connections
///
/// This trait lets the session run over real sockets in production and over
/// in-memory pipes in tests.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to the broker. Reports success or failure exactly once.
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream>;
}

/// Plain TCP, or TLS over TCP when the endpoint asks for it
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    fn tls_connector() -> io::Result<TlsConnector> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsConnector::from(Arc::new(config)))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;

        if !endpoint.tls {
            debug!(host = %endpoint.host, port = endpoint.port, "TCP connection established");
            return Ok(Box::new(stream));
        }

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls = Self::tls_connector()?.connect(server_name, stream).await?;
        debug!(host = %endpoint.host, port = endpoint.port, "TLS connection established");
        Ok(Box::new(tls))
    }
}
