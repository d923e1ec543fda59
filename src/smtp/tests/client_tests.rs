use super::*;
use crate::sasl::Plain;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Spawns a minimal scripted SMTP server over an in-memory duplex pair and
/// returns the client-side half, for exercising the staged client tokens
/// without a real socket.
async fn scripted_server(script: Vec<(&'static str, &'static str)>) -> tokio::io::DuplexStream {
    let (client, mut server) = tokio::io::duplex(8192);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        for (expected_prefix, response) in script {
            if !expected_prefix.is_empty() {
                let n = server.read(&mut buf).await.unwrap();
                let received = String::from_utf8_lossy(&buf[..n]);
                assert!(
                    received.starts_with(expected_prefix),
                    "expected command starting with {expected_prefix:?}, got {received:?}"
                );
            }
            server.write_all(response.as_bytes()).await.unwrap();
        }
    });
    client
}

#[tokio::test]
async fn full_session_through_ehlo_mail_rcpt_data() {
    let stream = scripted_server(vec![
        ("", "220 greeting\r\n"),
        ("EHLO", "250-hello\r\n250-PIPELINING\r\n250 SIZE 1000\r\n"),
        ("MAIL FROM:", "250 OK\r\n"),
        ("RCPT TO:", "250 OK\r\n"),
        ("DATA", "354 go ahead\r\n"),
        ("Subject", "250 accepted\r\n"),
        ("QUIT", "221 bye\r\n"),
    ])
    .await;

    let connected = Connected::new(stream);
    let (_greeting, greeted) = connected.read_greeting().await.unwrap();
    let (caps, ready) = greeted.ehlo("client.example").await.unwrap();
    assert!(caps.pipelining);
    assert_eq!(caps.size, Some(1000));

    let mut txn = ready.mail_from("sender@example.com", None).await.unwrap();
    let rcpt_reply = txn.rcpt_to("recipient@example.com").await.unwrap();
    assert!(rcpt_reply.is_positive());

    let mut body = txn.data().await.unwrap();
    body.send_chunk(b"Subject: hi\r\n\r\nhello\r\n").await.unwrap();
    let final_reply = body.finish().await.unwrap();
    assert!(final_reply.is_positive());
}

#[tokio::test]
async fn mail_from_rejected_surfaces_as_error() {
    let stream = scripted_server(vec![
        ("", "220 greeting\r\n"),
        ("EHLO", "250 hello\r\n"),
        ("MAIL FROM:", "451 try again later\r\n"),
    ])
    .await;

    let connected = Connected::new(stream);
    let (_greeting, greeted) = connected.read_greeting().await.unwrap();
    let (_caps, ready) = greeted.ehlo("client.example").await.unwrap();
    let result = ready.mail_from("sender@example.com", None).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn authenticate_with_plain_sends_base64_response_and_reads_success() {
    let stream = scripted_server(vec![
        ("", "220 greeting\r\n"),
        ("EHLO", "250-hello\r\n250 AUTH PLAIN\r\n"),
        ("AUTH PLAIN", "235 authenticated\r\n"),
    ])
    .await;

    let connected = Connected::new(stream);
    let (_greeting, greeted) = connected.read_greeting().await.unwrap();
    let (caps, ready) = greeted.ehlo("client.example").await.unwrap();
    assert_eq!(caps.auth_mechanisms, vec!["PLAIN"]);

    let mechanism = Box::new(Plain::new("alice", "hunter2"));
    let _ready = ready.authenticate(mechanism).await.unwrap();
}

#[tokio::test]
async fn bdat_sends_chunk_header_then_raw_bytes() {
    let stream = scripted_server(vec![
        ("", "220 greeting\r\n"),
        ("EHLO", "250-hello\r\n250 CHUNKING\r\n"),
        ("MAIL FROM:", "250 OK\r\n"),
        ("RCPT TO:", "250 OK\r\n"),
        ("BDAT", "250 chunk ok\r\n"),
    ])
    .await;

    let connected = Connected::new(stream);
    let (_greeting, greeted) = connected.read_greeting().await.unwrap();
    let (_caps, ready) = greeted.ehlo("client.example").await.unwrap();
    let mut txn = ready.mail_from("sender@example.com", None).await.unwrap();
    txn.rcpt_to("recipient@example.com").await.unwrap();
    let reply = txn.bdat(b"hello world", 1024).await.unwrap();
    assert!(reply.is_positive());
}
