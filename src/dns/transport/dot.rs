//! DNS-over-TLS transport (RFC 7858): TCP + TLS, each message framed with a
//! 2-byte big-endian length prefix. Grounded on the pack's DoT transport,
//! keeping its shared-`ClientConfig`-built-once shape but trading its
//! connection pool for a fresh connection per query, since this crate's
//! resolver already retries across servers rather than across pooled
//! connections.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{client::TlsStream, rustls, TlsConnector};

use super::{timed, DnsTransport, TransportError};

static SHARED_TLS_CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(rustls::ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth())
});

pub struct DotTransport {
    server_addr: SocketAddr,
    server_name: ServerName<'static>,
}

impl DotTransport {
    pub fn new(server_addr: SocketAddr, hostname: String) -> Result<Self, TransportError> {
        let server_name = ServerName::try_from(hostname).map_err(|e| TransportError::Protocol(format!("invalid TLS hostname: {e}")))?;
        Ok(DotTransport { server_addr, server_name })
    }

    async fn connect(&self, timeout: Duration) -> Result<TlsStream<TcpStream>, TransportError> {
        let tcp = timed(timeout, TcpStream::connect(self.server_addr)).await?;
        let connector = TlsConnector::from(SHARED_TLS_CONFIG.clone());
        tokio::time::timeout(timeout, connector.connect(self.server_name.clone(), tcp))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)
    }
}

#[async_trait]
impl DnsTransport for DotTransport {
    async fn send(&self, message: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if message.len() > 65535 {
            return Err(TransportError::Protocol("message too large for a 2-byte length prefix".into()));
        }
        let mut stream = self.connect(timeout).await?;

        let mut framed = Vec::with_capacity(message.len() + 2);
        framed.extend_from_slice(&(message.len() as u16).to_be_bytes());
        framed.extend_from_slice(message);
        timed(timeout, async { stream.write_all(&framed).await }).await?;
        timed(timeout, async { stream.flush().await }).await?;

        let mut length_prefix = [0u8; 2];
        timed(timeout, async { stream.read_exact(&mut length_prefix).await }).await?;
        let length = u16::from_be_bytes(length_prefix) as usize;
        if length == 0 {
            return Err(TransportError::Protocol("zero-length DoT frame".into()));
        }

        let mut body = vec![0u8; length];
        timed(timeout, async { stream.read_exact(&mut body).await }).await?;
        Ok(body)
    }

    fn protocol_name(&self) -> &'static str {
        "DoT"
    }
}
