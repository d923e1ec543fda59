//! Orchestrates process startup: loads configuration, builds the default
//! application hooks (recipient policy, auth backend, mailbox store), and
//! runs the SMTP and POP3 servers concurrently. Embedders who want their
//! own mailbox storage, auth realm, or message sink use the `smtp`/`pop3`
//! modules directly instead of this entry point.

pub mod config;
pub mod dns;
pub mod dot_stuffer;
pub mod pop3;
pub mod reactor;
pub mod resp;
pub mod sasl;
pub mod smtp;
pub mod staged;
pub mod tls;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info};
use tokio::select;
use tokio::sync::Mutex;

use config::Config;
use pop3::{Mailbox, MailboxMessage, Pop3AuthBackend};
use smtp::{AuthBackend, MessageSink, NoAuthBackend, ReceivedMessage, RecipientPolicy};

/// Accepts mail for any recipient and logs the completed message instead of
/// handing it to a storage backend. A standalone deployment embedding this
/// crate's default `run()` supplies its own [`MessageSink`] in place of
/// this one; mailbox storage itself is out of scope for the crate.
struct LoggingMessageSink;

#[async_trait]
impl MessageSink for LoggingMessageSink {
    async fn message_complete(&self, message: ReceivedMessage) -> Result<()> {
        info!(
            "message {} from {} to {:?} ({} bytes)",
            message.queue_id,
            message.sender,
            message.recipients,
            message.body.len()
        );
        Ok(())
    }
}

struct AcceptAllRecipients;

#[async_trait]
impl RecipientPolicy for AcceptAllRecipients {
    async fn accepts(&self, _recipient: &str) -> bool {
        true
    }
}

/// An in-memory POP3 mailbox store, keyed by username, used only by this
/// crate's standalone `run()`. A real deployment supplies a maildir/mbox-
/// backed [`Pop3AuthBackend`] instead.
#[derive(Default)]
struct InMemoryRealm {
    mailboxes: Mutex<HashMap<String, (String, Arc<InMemoryMailbox>)>>,
}

#[derive(Default)]
struct InMemoryMailbox {
    messages: Mutex<Vec<MailboxMessage>>,
}

#[async_trait]
impl Mailbox for InMemoryMailbox {
    async fn list(&self) -> Vec<MailboxMessage> {
        self.messages.lock().await.clone()
    }

    async fn mark_deleted(&self, number: u32) -> bool {
        let mut messages = self.messages.lock().await;
        match messages.iter_mut().find(|m| m.number == number) {
            Some(m) => {
                m.deleted = true;
                true
            }
            None => false,
        }
    }

    async fn commit(&self) {
        let mut messages = self.messages.lock().await;
        messages.retain(|m| !m.deleted);
    }
}

#[async_trait]
impl Pop3AuthBackend for InMemoryRealm {
    async fn verify_password(&self, username: &str, password: &str) -> bool {
        let mailboxes = self.mailboxes.lock().await;
        mailboxes.get(username).is_some_and(|(pw, _)| pw == password)
    }

    async fn verify_apop(&self, _username: &str, _banner: &str, _digest: &str) -> bool {
        // No shared secret is configured for the standalone realm; deployments
        // wanting APOP supply a realm that knows each user's secret.
        false
    }

    async fn open_mailbox(&self, username: &str) -> Option<Arc<dyn Mailbox>> {
        let mailboxes = self.mailboxes.lock().await;
        mailboxes.get(username).map(|(_, mb)| mb.clone() as Arc<dyn Mailbox>)
    }
}

/// Installs the process-wide `tracing` subscriber, bridging the `log`
/// facade macros used throughout the protocol modules into the same
/// subscriber via `tracing-log`. Verbosity is controlled by `RUST_LOG`,
/// defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_log::LogTracer::init();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Runs the standalone SMTP + POP3 server pair forever, using in-memory
/// defaults for every application hook. Intended for running this crate as
/// a binary rather than embedding it; returns only if one of the two
/// listeners fails to bind or its accept loop exits unexpectedly.
pub async fn run() -> Result<()> {
    info!(
        "starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e:#}");
            return Err(e);
        }
    };

    let tls_acceptor = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => Some(tls::load_tls_acceptor(cert, key)?),
        _ => None,
    };

    let smtp_server = smtp::Server::new(
        config.clone(),
        Arc::new(LoggingMessageSink),
        Arc::new(AcceptAllRecipients),
        Arc::new(NoAuthBackend) as Arc<dyn AuthBackend>,
        tls_acceptor.clone(),
    );

    let pop3_server = pop3::Server::new(
        config.clone(),
        Arc::new(InMemoryRealm::default()) as Arc<dyn Pop3AuthBackend>,
        tls_acceptor,
    );

    let smtp_handle = tokio::spawn(async move { smtp_server.run().await });
    let pop3_handle = tokio::spawn(async move { pop3_server.run().await });

    select! {
        res = smtp_handle => join_result("SMTP", res),
        res = pop3_handle => join_result("POP3", res),
    }
}

fn join_result(label: &str, res: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(Ok(())) => Err(anyhow::anyhow!("{label} server exited cleanly, which is unexpected for a long-running service")),
        Ok(Err(e)) => {
            error!("{label} server returned a fatal error: {e:#}");
            Err(e)
        }
        Err(join_error) => {
            error!("{label} server task failed: {join_error}");
            Err(anyhow::anyhow!("{label} server task failed: {join_error}"))
        }
    }
}
