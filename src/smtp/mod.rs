//! Handles the SMTP server logic: listening for connections, driving the
//! [`protocol`] state machine, performing STARTTLS upgrades and AUTH
//! exchanges, and handing completed messages to an application-supplied
//! [`MessageSink`].

pub mod client;
pub mod protocol;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use log::{error, info, trace};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use crate::config::Config;
use crate::reactor::AsyncStream;
use protocol::{AuthOutcome, SmtpCommandResult, SmtpProtocol, SmtpState};

/// A fully received message, handed to the application once `DATA`/`BDAT`
/// completes and the recipient(s) have been accepted.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub queue_id: Uuid,
    pub sender: String,
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
}

/// Application hook invoked once a message transaction commits. Replaces
/// the hardcoded webhook delivery of the application this framework grew
/// out of with an arbitrary sink the embedder supplies.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn message_complete(&self, message: ReceivedMessage) -> Result<()>;
}

/// Decides whether a recipient is one this server will accept mail for.
#[async_trait]
pub trait RecipientPolicy: Send + Sync {
    async fn accepts(&self, recipient: &str) -> bool;
}

/// Verifies SASL credentials during an `AUTH` exchange. Credential storage
/// itself (realms, password databases) is out of scope for this crate;
/// embedders provide their own implementation.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn verify(&self, authcid: &str, password: &str) -> bool;
}

/// An `AuthBackend` that accepts nothing, for deployments with no SASL
/// credential store configured.
pub struct NoAuthBackend;

#[async_trait]
impl AuthBackend for NoAuthBackend {
    async fn verify(&self, _authcid: &str, _password: &str) -> bool {
        false
    }
}

/// Represents the main SMTP server instance.
pub struct Server {
    config: Config,
    message_sink: Arc<dyn MessageSink>,
    recipient_policy: Arc<dyn RecipientPolicy>,
    auth_backend: Arc<dyn AuthBackend>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(
        config: Config,
        message_sink: Arc<dyn MessageSink>,
        recipient_policy: Arc<dyn RecipientPolicy>,
        auth_backend: Arc<dyn AuthBackend>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        Server {
            config,
            message_sink,
            recipient_policy,
            auth_backend,
            tls_acceptor,
        }
    }

    fn auth_mechanisms(&self) -> Vec<String> {
        if self.auth_backend_is_disabled() {
            Vec::new()
        } else {
            self.config.sasl_mechanisms.clone()
        }
    }

    fn auth_backend_is_disabled(&self) -> bool {
        false
    }

    /// Runs the main SMTP server loop: binds and accepts connections
    /// forever, spawning one task per connection.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.smtp_bind_address, self.config.smtp_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("SMTP server listening on {addr}");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("New SMTP connection from: {peer}");
                    let message_sink = Arc::clone(&self.message_sink);
                    let recipient_policy = Arc::clone(&self.recipient_policy);
                    let auth_backend = Arc::clone(&self.auth_backend);
                    let tls_acceptor = self.tls_acceptor.clone();
                    let auth_mechanisms = self.auth_mechanisms();
                    let max_message_size = self.config.max_message_size;

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(
                            stream,
                            message_sink,
                            recipient_policy,
                            auth_backend,
                            tls_acceptor,
                            auth_mechanisms,
                            max_message_size,
                        )
                        .await
                        {
                            error!("Error handling SMTP connection from {peer}: {e:#}");
                        }
                    });
                }
                Err(e) => error!("Error accepting SMTP connection: {e:?}"),
            }
        }
    }
}

struct Transaction {
    sender: String,
    recipients: Vec<String>,
    body: Vec<u8>,
}

impl Transaction {
    fn new() -> Self {
        Transaction {
            sender: String::new(),
            recipients: Vec::new(),
            body: Vec::new(),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    message_sink: Arc<dyn MessageSink>,
    recipient_policy: Arc<dyn RecipientPolicy>,
    auth_backend: Arc<dyn AuthBackend>,
    tls_acceptor: Option<TlsAcceptor>,
    auth_mechanisms: Vec<String>,
    max_message_size: u64,
) -> Result<()> {
    let boxed: Box<dyn AsyncStream> = Box::new(stream);
    let (reader, writer) = tokio::io::split(boxed);
    let mut protocol = SmtpProtocol::new(BufReader::new(reader), BufWriter::new(writer), max_message_size);
    protocol.send_greeting().await?;

    let mut transaction = Transaction::new();
    let tls_available = tls_acceptor.is_some();

    loop {
        trace!("SMTP({:?}): waiting for command", protocol.get_state());
        let line = protocol.read_line().await?;

        if protocol.get_state() != SmtpState::Data && protocol.get_state() != SmtpState::BdatChunk && line.is_empty() {
            info!("SMTP connection closed by client (EOF)");
            break;
        }

        let result = protocol.process_command(&line, &auth_mechanisms, tls_available).await?;

        match result {
            SmtpCommandResult::Quit => break,
            SmtpCommandResult::Continue => {}
            SmtpCommandResult::StartTls => {
                let acceptor = tls_acceptor.clone().expect("StartTls only emitted when tls_available");
                let (reader, mut writer) = protocol.into_parts();
                writer.flush().await?;
                let raw = reader.into_inner().unsplit(writer.into_inner());
                let tls_stream = acceptor.accept(raw).await?;
                let boxed: Box<dyn AsyncStream> = Box::new(tls_stream);
                let (new_reader, new_writer) = tokio::io::split(boxed);
                protocol = SmtpProtocol::new(BufReader::new(new_reader), BufWriter::new(new_writer), max_message_size);
                protocol.mark_tls_active();
                // RFC 3207: the whole session is forgotten on upgrade except
                // the peer address; the client must re-issue EHLO before any
                // envelope command is accepted again.
                transaction = Transaction::new();
                info!("SMTP connection upgraded to TLS");
            }
            SmtpCommandResult::MailFrom(email) => {
                transaction = Transaction::new();
                transaction.sender = email;
            }
            SmtpCommandResult::RcptTo(email) => {
                if recipient_policy.accepts(&email).await {
                    transaction.recipients.push(email);
                    protocol.accept_rcpt().await?;
                } else {
                    protocol.reject_rcpt("550 No such user here").await?;
                }
            }
            SmtpCommandResult::DataStart => {
                transaction.body.clear();
            }
            SmtpCommandResult::DataLine(content) => {
                transaction.body.extend_from_slice(content.as_bytes());
                transaction.body.extend_from_slice(b"\r\n");
            }
            SmtpCommandResult::DataEnd => {
                commit_transaction(&message_sink, &mut transaction).await;
            }
            SmtpCommandResult::BdatHeader { size, is_last } => {
                let chunk = protocol.read_exact_bytes(size).await?;
                transaction.body.extend_from_slice(&chunk);
                protocol.acknowledge_bdat(is_last).await?;
                if is_last {
                    commit_transaction(&message_sink, &mut transaction).await;
                }
            }
            SmtpCommandResult::AuthStart { mechanism, initial } => {
                let outcome = evaluate_auth(&auth_backend, &mechanism, initial.as_deref(), None).await;
                protocol.finish_auth(outcome).await?;
            }
            SmtpCommandResult::AuthResponse(response) => {
                let outcome = evaluate_auth(&auth_backend, "", None, Some(&response)).await;
                protocol.finish_auth(outcome).await?;
            }
        }
    }

    info!("Closing SMTP connection");
    Ok(())
}

async fn commit_transaction(message_sink: &Arc<dyn MessageSink>, transaction: &mut Transaction) {
    let message = ReceivedMessage {
        queue_id: Uuid::new_v4(),
        sender: transaction.sender.clone(),
        recipients: transaction.recipients.clone(),
        body: std::mem::take(&mut transaction.body),
    };
    info!(
        "Message {} accepted from {} for {:?}",
        message.queue_id, message.sender, message.recipients
    );
    if let Err(e) = message_sink.message_complete(message).await {
        error!("Message sink rejected a completed message: {e:#}");
    }
}

/// Decodes a base64 `AUTH PLAIN`/`AUTH LOGIN` exchange and checks it
/// against the configured [`AuthBackend`]. Mechanisms that require a
/// multi-round challenge beyond a single initial response (CRAM-MD5,
/// SCRAM-SHA-256) are left to client-side support; advertising them without
/// a verifying backend here would promise more than the server delivers,
/// so unsupported mechanisms fail closed.
async fn evaluate_auth(
    auth_backend: &Arc<dyn AuthBackend>,
    mechanism: &str,
    initial: Option<&str>,
    continuation: Option<&str>,
) -> AuthOutcome {
    let mechanism = mechanism.to_uppercase();
    let encoded = match (initial, continuation) {
        (Some(value), _) if !value.is_empty() => value,
        (_, Some(value)) => value,
        _ => return AuthOutcome::ChallengeContinue(String::new()),
    };

    let decoded = match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => return AuthOutcome::Failure,
    };

    match mechanism.as_str() {
        "PLAIN" => {
            let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
            if parts.len() != 3 {
                return AuthOutcome::Failure;
            }
            let authcid = String::from_utf8_lossy(parts[1]).to_string();
            let password = String::from_utf8_lossy(parts[2]).to_string();
            if auth_backend.verify(&authcid, &password).await {
                AuthOutcome::Success
            } else {
                AuthOutcome::Failure
            }
        }
        "LOGIN" | "" => {
            // LOGIN's two rounds (username, then password) both land here as
            // continuations; a minimal state-free check accepts only once
            // both halves have been seen is not distinguishable without
            // extra state, so LOGIN is evaluated as PLAIN-style single-shot
            // "user\0password" for this server's purposes and otherwise
            // prompts for the next field.
            if decoded.contains(&0) {
                let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
                let authcid = String::from_utf8_lossy(parts[0]).to_string();
                let password = String::from_utf8_lossy(parts.get(1).copied().unwrap_or_default()).to_string();
                if auth_backend.verify(&authcid, &password).await {
                    AuthOutcome::Success
                } else {
                    AuthOutcome::Failure
                }
            } else {
                AuthOutcome::ChallengeContinue(base64::engine::general_purpose::STANDARD.encode("Password:"))
            }
        }
        _ => AuthOutcome::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AcceptAll;

    #[async_trait]
    impl RecipientPolicy for AcceptAll {
        async fn accepts(&self, _recipient: &str) -> bool {
            true
        }
    }

    #[async_trait]
    impl AuthBackend for AcceptAll {
        async fn verify(&self, authcid: &str, password: &str) -> bool {
            authcid == "alice" && password == "hunter2"
        }
    }

    #[tokio::test]
    async fn plain_auth_with_correct_credentials_succeeds() {
        let backend: Arc<dyn AuthBackend> = Arc::new(AcceptAll);
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\0alice\0hunter2");
        let outcome = evaluate_auth(&backend, "PLAIN", Some(&encoded), None).await;
        assert!(matches!(outcome, AuthOutcome::Success));
    }

    #[tokio::test]
    async fn plain_auth_with_wrong_password_fails() {
        let backend: Arc<dyn AuthBackend> = Arc::new(AcceptAll);
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\0alice\0wrong");
        let outcome = evaluate_auth(&backend, "PLAIN", Some(&encoded), None).await;
        assert!(matches!(outcome, AuthOutcome::Failure));
    }
}
