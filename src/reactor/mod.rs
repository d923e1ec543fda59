//! The event-loop contract that every staged protocol handler is written
//! against, plus the one concrete, tokio-backed implementation this crate
//! ships so the framework is runnable on its own.
//!
//! The contract intentionally says nothing about *how* readiness is
//! detected or how many OS threads back it — only the operations a
//! connection handler is allowed to perform: send bytes, close, schedule
//! and cancel timers, run a callback on the connection's own loop
//! (`invoke_later`), and upgrade a plaintext endpoint to TLS in place.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// A live connection endpoint: the minimal surface a protocol handler needs
/// regardless of which reactor implementation is underneath it.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn send(&self, data: &[u8]) -> io::Result<()>;
    async fn close(&self) -> io::Result<()>;
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Handle to a scheduled timer. Cancellation is idempotent: cancelling a
/// timer that already fired, or cancelling twice, is not an error.
pub trait TimerHandle: Send {
    fn cancel(&self);
}

/// A boxed future, used where the reactor contract needs to stay
/// object-safe across `invoke_later`/timer callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The reactor contract. A production implementation (this crate's
/// [`TcpReactor`], or something embedding this crate into a larger event
/// loop) is responsible for actually driving readiness; everything above
/// this trait only ever calls through it.
#[async_trait]
pub trait Reactor: Send + Sync {
    type Endpoint: Endpoint;

    async fn connect(&self, addr: SocketAddr) -> io::Result<Self::Endpoint>;

    /// Schedules `callback` to run after `delay` on this connection's own
    /// loop. Returns a handle that can cancel the timer before it fires.
    fn schedule_timer(
        &self,
        delay: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Box<dyn TimerHandle>;

    /// Runs `callback` on the reactor's own loop at the next opportunity,
    /// used to hand work back from a cross-loop-shared component (such as
    /// the DNS resolver) to the loop that owns a particular connection.
    fn invoke_later(&self, callback: Box<dyn FnOnce() + Send>);
}

/// A byte stream whose concrete type is erased behind a trait object, so a
/// connection handler can hold "whatever `TcpStream` or
/// `tokio_rustls::server::TlsStream<TcpStream>` happens to be live right
/// now" as a single type across a STARTTLS/STLS upgrade, without the
/// upgrade changing the handler's own generic parameters.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> AsyncStream for T {}

/// In-place TLS upgrade, split out from [`Reactor`] because not every
/// endpoint kind supports it (a QUIC stream endpoint, for instance, is
/// already secured at the transport layer and has no plaintext phase).
#[async_trait]
pub trait SecureUpgrade {
    type Upgraded;

    async fn upgrade_client(self, connector: TlsConnector, server_name: &str) -> io::Result<Self::Upgraded>;
    async fn upgrade_server(self, acceptor: TlsAcceptor) -> io::Result<Self::Upgraded>;
}

/// Tokio-backed production [`Reactor`]. Each connection handler owns its
/// stream directly (single-threaded-per-connection cooperative model); the
/// reactor only brokers connect/timer/invoke_later operations that need a
/// shared runtime handle.
pub struct TcpReactor {
    handle: tokio::runtime::Handle,
}

impl TcpReactor {
    pub fn new() -> Self {
        TcpReactor {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl Default for TcpReactor {
    fn default() -> Self {
        Self::new()
    }
}

/// A plain TCP endpoint, usable as a [`Endpoint`] once wrapped for shared
/// send access (protocol handlers otherwise own the stream exclusively and
/// talk to it directly via `AsyncRead`/`AsyncWrite`).
pub struct TcpEndpoint {
    stream: Arc<Mutex<TcpStream>>,
    peer: Option<SocketAddr>,
}

impl TcpEndpoint {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        TcpEndpoint {
            stream: Arc::new(Mutex::new(stream)),
            peer,
        }
    }
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    async fn send(&self, data: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut stream = self.stream.lock().await;
        stream.write_all(data).await?;
        stream.flush().await
    }

    async fn close(&self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.stream.lock().await.shutdown().await
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[async_trait]
impl Reactor for TcpReactor {
    type Endpoint = TcpEndpoint;

    async fn connect(&self, addr: SocketAddr) -> io::Result<Self::Endpoint> {
        let stream = TcpStream::connect(addr).await?;
        Ok(TcpEndpoint::new(stream))
    }

    fn schedule_timer(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle> {
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let cancelled_for_task = Arc::clone(&cancelled);
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !cancelled_for_task.load(std::sync::atomic::Ordering::SeqCst) {
                callback();
            }
        });
        Box::new(AtomicTimerHandle { cancelled })
    }

    fn invoke_later(&self, callback: Box<dyn FnOnce() + Send>) {
        self.handle.spawn(async move { callback() });
    }
}

struct AtomicTimerHandle {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl TimerHandle for AtomicTimerHandle {
    fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Wraps any `AsyncRead + AsyncWrite` endpoint with rustls to support
/// upgrading a plaintext stream in place, mirroring the STARTTLS/STLS flow
/// both SMTP and POP3 need: the plaintext stream is consumed and a TLS
/// stream of the same read/write shape is produced, with no change to the
/// underlying TCP connection.
pub struct PlainStream<S> {
    inner: S,
}

impl<S> PlainStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(inner: S) -> Self {
        PlainStream { inner }
    }

    pub async fn upgrade_client(self, connector: TlsConnector, server_name: tokio_rustls::rustls::pki_types::ServerName<'static>) -> io::Result<tokio_rustls::client::TlsStream<S>> {
        connector.connect(server_name, self.inner).await
    }

    pub async fn upgrade_server(self, acceptor: TlsAcceptor) -> io::Result<tokio_rustls::server::TlsStream<S>> {
        acceptor.accept(self.inner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_handle_cancel_is_idempotent() {
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handle = AtomicTimerHandle { cancelled: Arc::clone(&cancelled) };
        handle.cancel();
        handle.cancel();
        assert!(cancelled.load(std::sync::atomic::Ordering::SeqCst));
    }
}
