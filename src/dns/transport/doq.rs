//! DNS-over-QUIC transport (RFC 9250): one bidirectional QUIC stream per
//! query, ALPN `"doq"`, no length prefix — the stream's FIN delimits the
//! message, so the client writes the query then finishes the send side and
//! reads the peer's response to completion.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint};
use tokio_rustls::rustls;

use super::{DnsTransport, TransportError};

const DOQ_ALPN: &[u8] = b"doq";
const MAX_RESPONSE_SIZE: usize = 65535;

static SHARED_TLS_CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = rustls::ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth();
    config.alpn_protocols = vec![DOQ_ALPN.to_vec()];
    Arc::new(config)
});

pub struct DoqTransport {
    server_addr: SocketAddr,
    server_name: String,
}

impl DoqTransport {
    pub fn new(server_addr: SocketAddr, server_name: String) -> Self {
        DoqTransport { server_addr, server_name }
    }

    fn client_config(&self) -> Result<ClientConfig, TransportError> {
        quinn::crypto::rustls::QuicClientConfig::try_from(SHARED_TLS_CONFIG.clone())
            .map(ClientConfig::new)
            .map_err(|e| TransportError::Protocol(format!("unsupported TLS config for QUIC: {e}")))
    }
}

#[async_trait]
impl DnsTransport for DoqTransport {
    async fn send(&self, message: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let bind_addr: SocketAddr = if self.server_addr.is_ipv6() { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
        let mut endpoint = Endpoint::client(bind_addr).map_err(TransportError::Io)?;
        endpoint.set_default_client_config(self.client_config()?);

        let connecting = endpoint.connect(self.server_addr, &self.server_name).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let connection = tokio::time::timeout(timeout, connecting).await.map_err(|_| TransportError::Timeout)?.map_err(|e| TransportError::Protocol(e.to_string()))?;

        let (mut send_stream, mut recv_stream) = tokio::time::timeout(timeout, connection.open_bi())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        tokio::time::timeout(timeout, send_stream.write_all(message)).await.map_err(|_| TransportError::Timeout)?.map_err(|e| TransportError::Protocol(e.to_string()))?;
        send_stream.finish().map_err(|e| TransportError::Protocol(e.to_string()))?;

        let response = tokio::time::timeout(timeout, recv_stream.read_to_end(MAX_RESPONSE_SIZE))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        connection.close(0u32.into(), b"done");
        endpoint.wait_idle().await;

        Ok(response)
    }

    fn protocol_name(&self) -> &'static str {
        "DoQ"
    }
}
