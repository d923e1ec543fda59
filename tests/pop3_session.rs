//! End-to-end POP3 session lifecycle over a real TCP loopback connection
//! (spec §8 end-to-end scenario 3): USER/PASS, STAT, LIST, DELE, then QUIT
//! commits the deletion so a fresh session only sees the surviving message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use staged_net::config::Config;
use staged_net::pop3::{Mailbox, MailboxMessage, Pop3AuthBackend, Server};

fn test_config(port: u16) -> Config {
    Config {
        smtp_bind_address: "127.0.0.1".to_string(),
        smtp_port: 0,
        pop3_bind_address: "127.0.0.1".to_string(),
        pop3_port: port,
        tls_cert_path: None,
        tls_key_path: None,
        sasl_mechanisms: vec![],
        dns_servers: vec![],
        dns_query_timeout: Duration::from_secs(1),
        dns_cache_capacity: 16,
        hosts_file_path: "/nonexistent-hosts".to_string(),
        max_message_size: 10 * 1024 * 1024,
    }
}

struct FixedMailbox {
    messages: Mutex<Vec<MailboxMessage>>,
}

#[async_trait]
impl Mailbox for FixedMailbox {
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

struct SingleUserRealm {
    mailbox: Arc<FixedMailbox>,
}

#[async_trait]
impl Pop3AuthBackend for SingleUserRealm {
    async fn verify_password(&self, username: &str, password: &str) -> bool {
        username == "alice" && password == "s3cret"
    }

    async fn verify_apop(&self, _username: &str, _banner: &str, _digest: &str) -> bool {
        false
    }

    async fn open_mailbox(&self, username: &str) -> Option<Arc<dyn Mailbox>> {
        if username == "alice" {
            Some(self.mailbox.clone())
        } else {
            None
        }
    }
}

async fn read_line(stream: &mut TcpStream) -> String {
    let mut acc = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if acc.ends_with(b"\r\n") {
            break;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed while waiting for a line");
        acc.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&acc).trim_end().to_string()
}

async fn read_until_dot(stream: &mut TcpStream) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let line = read_line(stream).await;
        if line == "." {
            break;
        }
        lines.push(line);
    }
    lines
}

fn two_messages() -> Vec<MailboxMessage> {
    vec![
        MailboxMessage { number: 1, uid: "uid-1".to_string(), octets: vec![0u8; 600], deleted: false },
        MailboxMessage { number: 2, uid: "uid-2".to_string(), octets: vec![0u8; 634], deleted: false },
    ]
}

#[tokio::test]
async fn session_lifecycle_stat_list_dele_commits_on_quit() {
    let port = 11100;
    let mailbox = Arc::new(FixedMailbox { messages: Mutex::new(two_messages()) });
    let realm = Arc::new(SingleUserRealm { mailbox: mailbox.clone() });
    let config = test_config(port);
    let server = Server::new(config, realm, None);

    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let greeting = read_line(&mut stream).await;
    assert!(greeting.starts_with("+OK"));

    stream.write_all(b"USER alice\r\n").await.unwrap();
    assert!(read_line(&mut stream).await.starts_with("+OK"));

    stream.write_all(b"PASS s3cret\r\n").await.unwrap();
    assert!(read_line(&mut stream).await.starts_with("+OK"));

    stream.write_all(b"STAT\r\n").await.unwrap();
    let stat = read_line(&mut stream).await;
    assert_eq!(stat, "+OK 2 1234");

    stream.write_all(b"LIST\r\n").await.unwrap();
    let header = read_line(&mut stream).await;
    assert!(header.starts_with("+OK"));
    let entries = read_until_dot(&mut stream).await;
    assert_eq!(entries, vec!["1 600".to_string(), "2 634".to_string()]);

    stream.write_all(b"DELE 1\r\n").await.unwrap();
    assert!(read_line(&mut stream).await.starts_with("+OK"));

    stream.write_all(b"QUIT\r\n").await.unwrap();
    assert!(read_line(&mut stream).await.starts_with("+OK"));
    drop(stream);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let remaining = mailbox.list().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].number, 2);
}
