//! Shared machinery behind the staged client protocols: a command issues a
//! [`ReplySink`] that is invoked exactly once with the server's reply, and
//! a streamed payload (a message body, a multi-line response) drives a
//! [`BodySink`] with zero or more content callbacks followed by exactly one
//! completion callback.
//!
//! SMTP and POP3 client state machines both build their capability tokens
//! on top of this: a command method consumes the current token, stashes a
//! sink describing "what to do with the reply", writes the command line,
//! and returns the token for whichever state comes next once that single
//! reply has been dispatched.

use std::fmt;

/// Receives the outcome of exactly one issued command.
///
/// `on_reply` is called once the server's response line(s) have been fully
/// read and parsed. `on_service_closing` is the universal fault path: it
/// fires instead of `on_reply` if the connection is lost, or the server
/// sends an unexpected closing reply (SMTP 421, POP3 `-ERR` during a
/// sequence that cannot recover), before any reply was dispatched.
pub trait ReplySink<R> {
    fn on_reply(self: Box<Self>, reply: R);
    fn on_service_closing(self: Box<Self>, reason: StagedError);
}

/// Receives a streamed body: any number of `on_content` calls carrying
/// successive chunks, followed by exactly one `on_complete`.
pub trait BodySink {
    fn on_content(&mut self, chunk: &[u8]);
    fn on_complete(self: Box<Self>);
    fn on_service_closing(self: Box<Self>, reason: StagedError);
}

/// Error surfaced to a sink instead of a normal reply.
#[derive(Debug)]
pub enum StagedError {
    Io(std::io::Error),
    ConnectionClosed,
    Protocol(String),
}

impl fmt::Display for StagedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagedError::Io(e) => write!(f, "i/o error: {e}"),
            StagedError::ConnectionClosed => write!(f, "connection closed by peer"),
            StagedError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for StagedError {}

impl From<std::io::Error> for StagedError {
    fn from(e: std::io::Error) -> Self {
        StagedError::Io(e)
    }
}

/// A one-shot sink backed by a oneshot channel, for call sites that want to
/// `.await` a command's reply rather than supply a callback object. Most of
/// the SMTP/POP3 client surface in this crate uses this rather than a
/// hand-written [`ReplySink`] impl per call site.
pub struct OneshotSink<R> {
    tx: tokio::sync::oneshot::Sender<Result<R, StagedError>>,
}

impl<R> OneshotSink<R> {
    pub fn pair() -> (Self, tokio::sync::oneshot::Receiver<Result<R, StagedError>>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (OneshotSink { tx }, rx)
    }
}

impl<R> ReplySink<R> for OneshotSink<R> {
    fn on_reply(self: Box<Self>, reply: R) {
        let _ = self.tx.send(Ok(reply));
    }

    fn on_service_closing(self: Box<Self>, reason: StagedError) {
        let _ = self.tx.send(Err(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oneshot_sink_delivers_exactly_one_reply() {
        let (sink, rx) = OneshotSink::<u16>::pair();
        Box::new(sink).on_reply(250);
        assert_eq!(rx.await.unwrap().unwrap(), 250);
    }

    #[tokio::test]
    async fn oneshot_sink_delivers_service_closing_as_error() {
        let (sink, rx) = OneshotSink::<u16>::pair();
        Box::new(sink).on_service_closing(StagedError::ConnectionClosed);
        assert!(rx.await.unwrap().is_err());
    }
}
