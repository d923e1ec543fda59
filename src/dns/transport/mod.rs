//! Pluggable DNS transports: UDP (one datagram per message), DoT (2-byte
//! length-prefixed TLS), and DoQ (one QUIC stream per query). The resolver
//! only ever talks to the [`DnsTransport`] trait, never to a concrete
//! transport, so new transports can be added without touching query logic.

pub mod doq;
pub mod dot;
pub mod udp;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    Timeout,
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
            TransportError::Timeout => write!(f, "timed out"),
            TransportError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// A single round-trip transport for one serialized DNS message. Each
/// implementation owns whatever connection state it needs (a bound UDP
/// socket, a pooled TLS stream, a QUIC endpoint); callers send one message
/// and get back exactly one reply or an error.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    async fn send(&self, message: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError>;

    fn protocol_name(&self) -> &'static str;
}

async fn with_timeout<T>(timeout: Duration, fut: impl std::future::Future<Output = std::io::Result<T>>) -> Result<T, TransportError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TransportError::Io(e)),
        Err(_) => Err(TransportError::Timeout),
    }
}

pub(crate) use with_timeout as timed;
