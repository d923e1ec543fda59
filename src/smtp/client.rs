//! Staged SMTP client: each state is a distinct type whose methods consume
//! `self` and return the next state, so a transaction that is out of
//! sequence (e.g. calling `rcpt_to` before `mail_from`) is a compile error
//! rather than a runtime one.
//!
//! Built around the same line-reading/response-parsing approach as the
//! server side, generalized from a free-function client into capability
//! tokens per this crate's staged-protocol design.

use std::fmt;

use anyhow::{anyhow, bail, Result};
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::dot_stuffer::DotStuffer;
use crate::sasl::SaslMechanism;

/// A parsed multi-line SMTP reply: a status code and the joined text of
/// every `code-text`/`code text` line that made up the reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" / "))
    }
}

/// Capabilities advertised in an `EHLO` response.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub starttls: bool,
    pub pipelining: bool,
    pub chunking: bool,
    pub smtputf8: bool,
    pub size: Option<u64>,
    pub auth_mechanisms: Vec<String>,
}

struct Wire<S> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
}

impl<S> Wire<S>
where
    S: AsyncWriteExt + tokio::io::AsyncRead + Unpin,
{
    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        let mut code = 0u16;
        loop {
            let mut raw = String::new();
            let n = self.reader.read_line(&mut raw).await?;
            if n == 0 {
                bail!("connection closed while reading SMTP reply");
            }
            let line = raw.trim_end_matches(['\r', '\n']);
            if line.len() < 4 {
                bail!("malformed SMTP reply line: {line:?}");
            }
            code = line[0..3].parse().map_err(|_| anyhow!("non-numeric SMTP reply code in {line:?}"))?;
            let sep = line.as_bytes()[3];
            lines.push(line[4..].to_string());
            if sep == b' ' {
                break;
            }
            // sep == b'-' means more lines follow with the same code.
        }
        Ok(Reply { code, lines })
    }

    /// Rejoins the split reader/writer halves back into the original
    /// stream, for handing off to a TLS handshake on STARTTLS.
    async fn into_stream(mut self) -> Result<S> {
        self.writer.flush().await?;
        Ok(self.reader.into_inner().unsplit(self.writer))
    }
}

/// Splits an owned, already-connected stream (plaintext or already-TLS) and
/// returns the first staged token: waiting for the server's greeting.
pub struct Connected<S> {
    wire: Wire<S>,
}

impl<S> Connected<S>
where
    S: AsyncWriteExt + tokio::io::AsyncRead + Unpin,
{
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Connected {
            wire: Wire {
                reader: BufReader::new(read_half),
                writer: write_half,
            },
        }
    }

    /// Waits for the server's `220` greeting.
    pub async fn read_greeting(mut self) -> Result<(Reply, Greeted<S>)> {
        let reply = self.wire.read_reply().await?;
        if reply.code != 220 {
            bail!("expected 220 greeting, got {reply}");
        }
        Ok((reply.clone(), Greeted { wire: self.wire }))
    }
}

/// Greeting received; the client may now send `EHLO`/`HELO`.
pub struct Greeted<S> {
    wire: Wire<S>,
}

impl<S> Greeted<S>
where
    S: AsyncWriteExt + tokio::io::AsyncRead + Unpin,
{
    pub async fn ehlo(mut self, domain: &str) -> Result<(Capabilities, Ready<S>)> {
        self.wire.write_line(&format!("EHLO {domain}")).await?;
        let reply = self.wire.read_reply().await?;
        if !reply.is_positive() {
            bail!("EHLO rejected: {reply}");
        }
        let mut caps = Capabilities::default();
        for line in &reply.lines[1..] {
            let upper = line.to_uppercase();
            if upper == "STARTTLS" {
                caps.starttls = true;
            } else if upper == "PIPELINING" {
                caps.pipelining = true;
            } else if upper == "CHUNKING" {
                caps.chunking = true;
            } else if upper == "SMTPUTF8" {
                caps.smtputf8 = true;
            } else if let Some(size) = upper.strip_prefix("SIZE ").and_then(|v| v.parse().ok()) {
                caps.size = Some(size);
            } else if let Some(mechs) = upper.strip_prefix("AUTH ") {
                caps.auth_mechanisms = mechs.split_whitespace().map(|s| s.to_string()).collect();
            }
        }
        Ok((caps, Ready { wire: self.wire }))
    }

    pub async fn helo(mut self, domain: &str) -> Result<Ready<S>> {
        self.wire.write_line(&format!("HELO {domain}")).await?;
        let reply = self.wire.read_reply().await?;
        if !reply.is_positive() {
            bail!("HELO rejected: {reply}");
        }
        Ok(Ready { wire: self.wire })
    }
}

/// Post-`EHLO`/`HELO`: `STARTTLS`, `AUTH`, or `MAIL FROM` are all legal.
pub struct Ready<S> {
    wire: Wire<S>,
}

impl<S> Ready<S>
where
    S: AsyncWriteExt + tokio::io::AsyncRead + Unpin,
{
    /// Sends `STARTTLS`, consuming this token, and returns the raw stream
    /// underneath it. The caller performs the TLS handshake over that
    /// stream, then must re-issue `EHLO` per RFC 3207 by constructing a new
    /// [`Greeted`] (via [`Connected::new`]) around the resulting secured
    /// stream — no command other than `EHLO`/`QUIT` is reachable before
    /// that, since the old `Ready<S>` token was consumed and no new one is
    /// handed back directly.
    pub async fn starttls(mut self) -> Result<S> {
        self.wire.write_line("STARTTLS").await?;
        let reply = self.wire.read_reply().await?;
        if reply.code != 220 {
            bail!("STARTTLS rejected: {reply}");
        }
        self.wire.into_stream().await
    }

    /// Drives an `AUTH` exchange to completion using the supplied SASL
    /// mechanism, returning to `Ready` on success.
    pub async fn authenticate(mut self, mut mechanism: Box<dyn SaslMechanism>) -> Result<Ready<S>> {
        let initial = mechanism.initial_response();
        let command = match &initial {
            Some(resp) => format!(
                "AUTH {} {}",
                mechanism.name(),
                base64::engine::general_purpose::STANDARD.encode(resp)
            ),
            None => format!("AUTH {}", mechanism.name()),
        };
        self.wire.write_line(&command).await?;

        loop {
            let reply = self.wire.read_reply().await?;
            if reply.code == 235 {
                return Ok(self);
            }
            if reply.code == 535 {
                bail!("authentication failed: {reply}");
            }
            if reply.code != 334 {
                bail!("unexpected reply during AUTH: {reply}");
            }
            let challenge_b64 = reply.lines.first().cloned().unwrap_or_default();
            let challenge = base64::engine::general_purpose::STANDARD
                .decode(challenge_b64)
                .map_err(|e| anyhow!("server sent non-base64 challenge: {e}"))?;
            let response = mechanism
                .respond(&challenge)
                .map_err(|e| anyhow!("SASL mechanism error: {e}"))?;
            let encoded = match response {
                Some(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
                None => "*".to_string(),
            };
            self.wire.write_line(&encoded).await?;
        }
    }

    pub async fn mail_from(mut self, sender: &str, size: Option<u64>) -> Result<Transaction<S>> {
        let mut command = format!("MAIL FROM:<{sender}>");
        if let Some(size) = size {
            command.push_str(&format!(" SIZE={size}"));
        }
        self.wire.write_line(&command).await?;
        let reply = self.wire.read_reply().await?;
        if !reply.is_positive() {
            bail!("MAIL FROM rejected: {reply}");
        }
        Ok(Transaction {
            wire: self.wire,
            recipients: Vec::new(),
        })
    }

    pub async fn quit(mut self) -> Result<()> {
        self.wire.write_line("QUIT").await?;
        let _ = self.wire.read_reply().await?;
        Ok(())
    }
}

/// `MAIL FROM` accepted; any number of `RCPT TO` may follow before `DATA`.
pub struct Transaction<S> {
    wire: Wire<S>,
    recipients: Vec<String>,
}

impl<S> Transaction<S>
where
    S: AsyncWriteExt + tokio::io::AsyncRead + Unpin,
{
    /// Adds a recipient. Returns `Err` (without consuming the token, since
    /// `self` is `&mut`) if the server rejects it, so the caller can try
    /// further recipients on the same transaction.
    pub async fn rcpt_to(&mut self, recipient: &str) -> Result<Reply> {
        self.wire.write_line(&format!("RCPT TO:<{recipient}>")).await?;
        let reply = self.wire.read_reply().await?;
        if reply.is_positive() {
            self.recipients.push(recipient.to_string());
        }
        Ok(reply)
    }

    pub fn accepted_recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Begins the dot-stuffed `DATA` body transfer.
    pub async fn data(mut self) -> Result<BodyTransfer<S>> {
        if self.recipients.is_empty() {
            bail!("at least one accepted RCPT TO is required before DATA");
        }
        self.wire.write_line("DATA").await?;
        let reply = self.wire.read_reply().await?;
        if reply.code != 354 {
            bail!("DATA rejected: {reply}");
        }
        Ok(BodyTransfer {
            wire: self.wire,
            dot_stuffer: DotStuffer::new(),
        })
    }

    /// Sends the body as `BDAT` chunks instead of dot-stuffed `DATA`,
    /// available once `CHUNKING` was advertised.
    pub async fn bdat(mut self, body: &[u8], chunk_size: usize) -> Result<Reply> {
        if self.recipients.is_empty() {
            bail!("at least one accepted RCPT TO is required before BDAT");
        }
        let chunk_size = chunk_size.max(1);
        let mut offset = 0;
        let mut last_reply = None;
        while offset < body.len() || last_reply.is_none() {
            let end = (offset + chunk_size).min(body.len());
            let chunk = &body[offset..end];
            let is_last = end == body.len();
            self.wire
                .write_line(&format!("BDAT {}{}", chunk.len(), if is_last { " LAST" } else { "" }))
                .await?;
            self.wire.writer.write_all(chunk).await?;
            self.wire.writer.flush().await?;
            let reply = self.wire.read_reply().await?;
            if !reply.is_positive() {
                bail!("BDAT chunk rejected: {reply}");
            }
            offset = end;
            last_reply = Some(reply);
            if body.is_empty() {
                break;
            }
        }
        Ok(last_reply.expect("loop always executes at least once"))
    }
}

/// Mid-`DATA` transfer: any number of `send_chunk` calls, then `finish`.
pub struct BodyTransfer<S> {
    wire: Wire<S>,
    dot_stuffer: DotStuffer,
}

impl<S> BodyTransfer<S>
where
    S: AsyncWriteExt + tokio::io::AsyncRead + Unpin,
{
    /// Stuffs and sends one chunk of the message body. May be called any
    /// number of times, in any chunking the caller finds convenient; the
    /// stuffing state machine tracks line boundaries across calls.
    pub async fn send_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let mut stuffed = Vec::with_capacity(chunk.len());
        self.dot_stuffer.stuff(chunk, &mut stuffed);
        self.wire.writer.write_all(&stuffed).await?;
        Ok(())
    }

    /// Finalizes the body with the `.` terminator and reads the server's
    /// final acceptance reply.
    pub async fn finish(mut self) -> Result<Reply> {
        let mut terminator = Vec::new();
        self.dot_stuffer.end_message(&mut terminator);
        self.wire.writer.write_all(&terminator).await?;
        self.wire.writer.flush().await?;
        self.wire.read_reply().await
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
