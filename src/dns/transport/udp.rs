//! Plain UDP DNS transport: bind an ephemeral socket, connect it to the
//! server so the kernel filters replies from anyone else, send the message,
//! and read back exactly one datagram.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{timed, DnsTransport, TransportError};

pub struct UdpTransport {
    server_addr: SocketAddr,
}

impl UdpTransport {
    pub fn new(server_addr: SocketAddr) -> Self {
        UdpTransport { server_addr }
    }
}

#[async_trait]
impl DnsTransport for UdpTransport {
    async fn send(&self, message: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let bind_addr: SocketAddr = if self.server_addr.is_ipv6() { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.server_addr).await?;

        timed(timeout, socket.send(message)).await?;

        let mut buf = vec![0u8; 65535];
        let len = timed(timeout, socket.recv(&mut buf)).await?;
        buf.truncate(len);
        Ok(buf)
    }

    fn protocol_name(&self) -> &'static str {
        "UDP"
    }
}
