//! POP3 server: listens for connections, drives the [`protocol`] state
//! machine, and serves mailbox contents through an application-supplied
//! [`Mailbox`] backend. Mailbox storage itself (maildir, database-backed,
//! S3-backed, ...) is out of scope for this crate; only the trait boundary
//! is defined here.

pub mod client;
pub mod protocol;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use log::{error, info, trace};
use md5::{Digest, Md5};
use tokio::net::{TcpListener, TcpStream};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::reactor::AsyncStream;
use protocol::{Pop3CommandResult, Pop3Protocol, Pop3State};

/// A single message in a mailbox, as POP3 exposes it: a 1-based message
/// number, the raw RFC 822 octets, and a UID stable across sessions
/// (`UIDL`).
#[derive(Debug, Clone)]
pub struct MailboxMessage {
    pub number: u32,
    pub uid: String,
    pub octets: Vec<u8>,
    pub deleted: bool,
}

/// Per-session view over a user's mailbox. One instance is opened per
/// authenticated connection and is responsible for enforcing the
/// maildrop-lock semantics RFC 1939 requires during `Transaction`/`Update`.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn list(&self) -> Vec<MailboxMessage>;
    async fn mark_deleted(&self, number: u32) -> bool;
    /// Commits deletions and releases the maildrop lock, called when the
    /// session enters `Update` via `QUIT`.
    async fn commit(&self);
}

/// Authenticates POP3 sessions and opens a [`Mailbox`] once credentials are
/// accepted. Credential storage is out of scope; embedders supply their
/// own realm.
#[async_trait]
pub trait Pop3AuthBackend: Send + Sync {
    async fn verify_password(&self, username: &str, password: &str) -> bool;
    /// Verifies an APOP digest: MD5(banner + shared secret), hex-encoded.
    /// The backend is responsible for knowing the shared secret for
    /// `username`; a backend with no APOP support should always return
    /// `false`.
    async fn verify_apop(&self, username: &str, banner: &str, digest: &str) -> bool;
    async fn open_mailbox(&self, username: &str) -> Option<Arc<dyn Mailbox>>;
}

pub struct Server {
    config: Config,
    auth_backend: Arc<dyn Pop3AuthBackend>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(config: Config, auth_backend: Arc<dyn Pop3AuthBackend>, tls_acceptor: Option<TlsAcceptor>) -> Self {
        Server {
            config,
            auth_backend,
            tls_acceptor,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.pop3_bind_address, self.config.pop3_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("POP3 server listening on {addr}");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("New POP3 connection from: {peer}");
                    let auth_backend = Arc::clone(&self.auth_backend);
                    let tls_acceptor = self.tls_acceptor.clone();
                    let auth_mechanisms = self.config.sasl_mechanisms.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, auth_backend, tls_acceptor, auth_mechanisms).await {
                            error!("Error handling POP3 connection from {peer}: {e:#}");
                        }
                    });
                }
                Err(e) => error!("Error accepting POP3 connection: {e:?}"),
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    auth_backend: Arc<dyn Pop3AuthBackend>,
    tls_acceptor: Option<TlsAcceptor>,
    auth_mechanisms: Vec<String>,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let boxed: Box<dyn AsyncStream> = Box::new(stream);
    let (reader, writer) = tokio::io::split(boxed);
    let mut protocol = Pop3Protocol::new(BufReader::new(reader), BufWriter::new(writer));

    let banner = format!("<{}.{}@staged-net>", std::process::id(), peer.map(|p| p.port()).unwrap_or(0));
    protocol.send_greeting(&banner).await?;

    let tls_available = tls_acceptor.is_some();
    let mut mailbox: Option<Arc<dyn Mailbox>> = None;

    loop {
        trace!("POP3({:?}): waiting for command", protocol.get_state());
        let line = protocol.read_line().await?;
        if protocol.get_state() != Pop3State::Transaction && line.is_empty() {
            break;
        }

        let result = protocol.process_command(&line, tls_available, &auth_mechanisms).await?;

        match result {
            Pop3CommandResult::Quit => {
                if let Some(mb) = &mailbox {
                    mb.commit().await;
                }
                break;
            }
            Pop3CommandResult::Continue => {}
            Pop3CommandResult::Capa => {
                protocol.write_line("+OK Capability list follows").await?;
                protocol.write_line("USER").await?;
                protocol.write_line("UIDL").await?;
                protocol.write_line("TOP").await?;
                if tls_available && !protocol.is_tls_active() {
                    protocol.write_line("STLS").await?;
                }
                if !auth_mechanisms.is_empty() {
                    protocol.write_line(&format!("SASL {}", auth_mechanisms.join(" "))).await?;
                }
                protocol.write_line(".").await?;
            }
            Pop3CommandResult::Stls => {
                let acceptor = tls_acceptor.clone().expect("Stls only emitted when tls_available");
                let (reader, mut writer) = protocol.into_parts();
                writer.flush().await?;
                let raw = reader.into_inner().unsplit(writer.into_inner());
                let tls_stream = acceptor.accept(raw).await?;
                let boxed: Box<dyn AsyncStream> = Box::new(tls_stream);
                let (new_reader, new_writer) = tokio::io::split(boxed);
                protocol = Pop3Protocol::new(BufReader::new(new_reader), BufWriter::new(new_writer));
                protocol.mark_tls_active();
                info!("POP3 connection upgraded to TLS");
            }
            Pop3CommandResult::Pass { username, password } => {
                if auth_backend.verify_password(&username, &password).await {
                    mailbox = auth_backend.open_mailbox(&username).await;
                    protocol.complete_authentication(mailbox.is_some());
                    if mailbox.is_some() {
                        protocol.write_line("+OK logged in").await?;
                    } else {
                        protocol.write_line("-ERR unable to open mailbox").await?;
                    }
                } else {
                    protocol.complete_authentication(false);
                    protocol.write_line("-ERR invalid credentials").await?;
                }
            }
            Pop3CommandResult::Apop { username, digest } => {
                if auth_backend.verify_apop(&username, &banner, &digest).await {
                    mailbox = auth_backend.open_mailbox(&username).await;
                    protocol.complete_authentication(mailbox.is_some());
                    if mailbox.is_some() {
                        protocol.write_line("+OK logged in").await?;
                    } else {
                        protocol.write_line("-ERR unable to open mailbox").await?;
                    }
                } else {
                    protocol.complete_authentication(false);
                    protocol.write_line("-ERR invalid APOP digest").await?;
                }
            }
            Pop3CommandResult::Stat => {
                let messages = mailbox_messages(&mailbox).await;
                let (count, size) = stat(&messages);
                protocol.write_line(&format!("+OK {count} {size}")).await?;
            }
            Pop3CommandResult::List(index) => {
                let messages = mailbox_messages(&mailbox).await;
                respond_list(&mut protocol, &messages, index, |m| m.octets.len()).await?;
            }
            Pop3CommandResult::Uidl(index) => {
                let messages = mailbox_messages(&mailbox).await;
                match index {
                    Some(n) => match messages.iter().find(|m| m.number == n && !m.deleted) {
                        Some(m) => protocol.write_line(&format!("+OK {} {}", m.number, m.uid)).await?,
                        None => protocol.write_line("-ERR no such message").await?,
                    },
                    None => {
                        protocol.write_line("+OK").await?;
                        for m in messages.iter().filter(|m| !m.deleted) {
                            protocol.write_line(&format!("{} {}", m.number, m.uid)).await?;
                        }
                        protocol.write_line(".").await?;
                    }
                }
            }
            Pop3CommandResult::Retr(number) => {
                let messages = mailbox_messages(&mailbox).await;
                match messages.iter().find(|m| m.number == number && !m.deleted) {
                    Some(m) => {
                        protocol.write_line(&format!("+OK {} octets", m.octets.len())).await?;
                        protocol.write_multiline(&m.octets).await?;
                    }
                    None => protocol.write_line("-ERR no such message").await?,
                }
            }
            Pop3CommandResult::Top(number, lines) => {
                let messages = mailbox_messages(&mailbox).await;
                match messages.iter().find(|m| m.number == number && !m.deleted) {
                    Some(m) => {
                        let truncated = take_headers_and_lines(&m.octets, lines as usize);
                        protocol.write_line("+OK top of message follows").await?;
                        protocol.write_multiline(&truncated).await?;
                    }
                    None => protocol.write_line("-ERR no such message").await?,
                }
            }
            Pop3CommandResult::Dele(number) => {
                if let Some(mb) = &mailbox {
                    if mb.mark_deleted(number).await {
                        protocol.write_line("+OK message deleted").await?;
                    } else {
                        protocol.write_line("-ERR no such message").await?;
                    }
                } else {
                    protocol.write_line("-ERR not authenticated").await?;
                }
            }
            Pop3CommandResult::Rset => {
                protocol.write_line("+OK").await?;
            }
            Pop3CommandResult::AuthStart { mechanism, initial } => {
                match evaluate_auth(&auth_backend, &mechanism, initial.as_deref(), None).await {
                    AuthResult::Success(username) => {
                        mailbox = auth_backend.open_mailbox(&username).await;
                        protocol.complete_authentication(mailbox.is_some());
                        if mailbox.is_some() {
                            protocol.write_line("+OK logged in").await?;
                        } else {
                            protocol.write_line("-ERR unable to open mailbox").await?;
                        }
                    }
                    AuthResult::Challenge(challenge) => protocol.send_auth_challenge(&challenge).await?,
                    AuthResult::Failure => protocol.fail_auth("-ERR authentication failed").await?,
                }
            }
            Pop3CommandResult::AuthResponse(response) => {
                match evaluate_auth(&auth_backend, "", None, Some(&response)).await {
                    AuthResult::Success(username) => {
                        mailbox = auth_backend.open_mailbox(&username).await;
                        protocol.complete_authentication(mailbox.is_some());
                        if mailbox.is_some() {
                            protocol.write_line("+OK logged in").await?;
                        } else {
                            protocol.write_line("-ERR unable to open mailbox").await?;
                        }
                    }
                    AuthResult::Challenge(challenge) => protocol.send_auth_challenge(&challenge).await?,
                    AuthResult::Failure => protocol.fail_auth("-ERR authentication failed").await?,
                }
            }
        }
    }

    info!("Closing POP3 connection");
    Ok(())
}

async fn mailbox_messages(mailbox: &Option<Arc<dyn Mailbox>>) -> Vec<MailboxMessage> {
    match mailbox {
        Some(mb) => mb.list().await,
        None => Vec::new(),
    }
}

fn stat(messages: &[MailboxMessage]) -> (usize, usize) {
    let live: Vec<&MailboxMessage> = messages.iter().filter(|m| !m.deleted).collect();
    (live.len(), live.iter().map(|m| m.octets.len()).sum())
}

async fn respond_list<R, W>(
    protocol: &mut Pop3Protocol<R, W>,
    messages: &[MailboxMessage],
    index: Option<u32>,
    size_of: impl Fn(&MailboxMessage) -> usize,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    match index {
        Some(n) => match messages.iter().find(|m| m.number == n && !m.deleted) {
            Some(m) => protocol.write_line(&format!("+OK {} {}", m.number, size_of(m))).await,
            None => protocol.write_line("-ERR no such message").await,
        },
        None => {
            let (count, total) = stat(messages);
            protocol.write_line(&format!("+OK {count} messages ({total} octets)")).await?;
            for m in messages.iter().filter(|m| !m.deleted) {
                protocol.write_line(&format!("{} {}", m.number, size_of(m))).await?;
            }
            protocol.write_line(".").await
        }
    }
}

/// Outcome of evaluating a POP3 `AUTH` exchange against the configured
/// [`Pop3AuthBackend`]. Unlike SMTP's `AuthOutcome`, success also carries the
/// authenticated username so the driver can open that user's mailbox.
enum AuthResult {
    Success(String),
    /// Carries the next base64-encoded challenge to send to the client.
    Challenge(String),
    Failure,
}

/// Decodes a base64 `AUTH PLAIN`/`AUTH LOGIN` exchange and checks it against
/// the configured [`Pop3AuthBackend`]. Mirrors `smtp::evaluate_auth`'s
/// single-initial-response simplification: mechanisms needing more than one
/// challenge round beyond LOGIN's username/password pair are not supported
/// here since no backend in this crate verifies them.
async fn evaluate_auth(
    auth_backend: &Arc<dyn Pop3AuthBackend>,
    mechanism: &str,
    initial: Option<&str>,
    continuation: Option<&str>,
) -> AuthResult {
    let mechanism = mechanism.to_uppercase();
    let encoded = match (initial, continuation) {
        (Some(value), _) if !value.is_empty() => value,
        (_, Some(value)) => value,
        _ => return AuthResult::Challenge(String::new()),
    };

    let decoded = match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => return AuthResult::Failure,
    };

    match mechanism.as_str() {
        "PLAIN" => {
            let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
            if parts.len() != 3 {
                return AuthResult::Failure;
            }
            let authcid = String::from_utf8_lossy(parts[1]).to_string();
            let password = String::from_utf8_lossy(parts[2]).to_string();
            if auth_backend.verify_password(&authcid, &password).await {
                AuthResult::Success(authcid)
            } else {
                AuthResult::Failure
            }
        }
        "LOGIN" | "" => {
            if decoded.contains(&0) {
                let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
                let authcid = String::from_utf8_lossy(parts[0]).to_string();
                let password = String::from_utf8_lossy(parts.get(1).copied().unwrap_or_default()).to_string();
                if auth_backend.verify_password(&authcid, &password).await {
                    AuthResult::Success(authcid)
                } else {
                    AuthResult::Failure
                }
            } else {
                AuthResult::Challenge(base64::engine::general_purpose::STANDARD.encode("Password:"))
            }
        }
        _ => AuthResult::Failure,
    }
}

/// Computes the APOP digest a client should send: `MD5(banner + secret)`,
/// hex-encoded, as used by [`Pop3AuthBackend::verify_apop`] implementations.
pub fn apop_digest(banner: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(banner.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns the full header block plus up to `body_lines` lines of the body,
/// for `TOP`.
fn take_headers_and_lines(octets: &[u8], body_lines: usize) -> Vec<u8> {
    let text = String::from_utf8_lossy(octets);
    let mut out = Vec::new();
    let mut in_body = false;
    let mut emitted = 0;
    for line in text.split("\r\n") {
        if !in_body {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
            if line.is_empty() {
                in_body = true;
            }
        } else {
            if emitted >= body_lines {
                break;
            }
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
            emitted += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apop_digest_is_deterministic() {
        let a = apop_digest("<banner>", "secret");
        let b = apop_digest("<banner>", "secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn top_truncates_body_but_keeps_full_headers() {
        let message = b"Subject: hi\r\nFrom: a@b.com\r\n\r\nline1\r\nline2\r\nline3\r\n";
        let result = take_headers_and_lines(message, 1);
        let text = String::from_utf8(result).unwrap();
        assert!(text.contains("Subject: hi"));
        assert!(text.contains("line1"));
        assert!(!text.contains("line2"));
    }
}
