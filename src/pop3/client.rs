//! Staged POP3 client, mirroring [`crate::smtp::client`]'s typestate
//! design: `Connected` → `Authorization` → `Transaction`, with `RETR`/`TOP`
//! able to stream their multi-line response through a [`crate::staged::BodySink`]
//! instead of buffering the whole message.

use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::dot_stuffer::DotStuffer;
use crate::pop3::apop_digest;
use crate::staged::{BodySink, StagedError};

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

    async fn read_line(&mut self) -> Result<String> {
        let mut raw = String::new();
        let n = self.reader.read_line(&mut raw).await?;
        if n == 0 {
            bail!("connection closed while reading POP3 reply");
        }
        Ok(raw.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_status(&mut self) -> Result<(bool, String)> {
        let line = self.read_line().await?;
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok((true, rest.trim_start().to_string()))
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            Ok((false, rest.trim_start().to_string()))
        } else {
            bail!("malformed POP3 status line: {line:?}")
        }
    }

    /// Reads a dot-stuffed multi-line response to completion, returning the
    /// un-stuffed body.
    async fn read_multiline(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            match DotStuffer::unstuff_line(&line) {
                None => break,
                Some(content) => {
                    body.extend_from_slice(content.as_bytes());
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        Ok(body)
    }

    /// Streams a dot-stuffed multi-line response into `sink` instead of
    /// buffering it, for large `RETR` bodies.
    async fn stream_multiline(&mut self, sink: &mut dyn BodySink) -> Result<()> {
        loop {
            let line = match self.read_line().await {
                Ok(l) => l,
                Err(e) => return Err(anyhow!(e)),
            };
            match DotStuffer::unstuff_line(&line) {
                None => break,
                Some(content) => {
                    sink.on_content(content.as_bytes());
                    sink.on_content(b"\r\n");
                }
            }
        }
        Ok(())
    }
}

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

    /// Reads the `+OK` greeting, returning the banner text (which carries
    /// the APOP challenge, if the server offers one) and the next token.
    pub async fn read_greeting(mut self) -> Result<(String, Authorization<S>)> {
        let (ok, banner) = self.wire.read_status().await?;
        if !ok {
            bail!("server greeted with an error: {banner}");
        }
        Ok((banner, Authorization { wire: self.wire }))
    }
}

pub struct Authorization<S> {
    wire: Wire<S>,
}

impl<S> Authorization<S>
where
    S: AsyncWriteExt + tokio::io::AsyncRead + Unpin,
{
    pub async fn user_pass(mut self, username: &str, password: &str) -> Result<Transaction<S>> {
        self.wire.write_line(&format!("USER {username}")).await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("USER rejected: {msg}");
        }
        self.wire.write_line(&format!("PASS {password}")).await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("PASS rejected: {msg}");
        }
        Ok(Transaction { wire: self.wire })
    }

    pub async fn apop(mut self, username: &str, banner: &str, secret: &str) -> Result<Transaction<S>> {
        let digest = apop_digest(banner, secret);
        self.wire.write_line(&format!("APOP {username} {digest}")).await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("APOP rejected: {msg}");
        }
        Ok(Transaction { wire: self.wire })
    }

    pub async fn stls(mut self) -> Result<()> {
        self.wire.write_line("STLS").await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("STLS rejected: {msg}");
        }
        Ok(())
    }

    pub async fn quit(mut self) -> Result<()> {
        self.wire.write_line("QUIT").await?;
        let _ = self.wire.read_status().await?;
        Ok(())
    }
}

pub struct Transaction<S> {
    wire: Wire<S>,
}

impl<S> Transaction<S>
where
    S: AsyncWriteExt + tokio::io::AsyncRead + Unpin,
{
    pub async fn stat(&mut self) -> Result<(u32, u64)> {
        self.wire.write_line("STAT").await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("STAT failed: {msg}");
        }
        let mut parts = msg.split_whitespace();
        let count = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| anyhow!("malformed STAT reply"))?;
        let size = parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| anyhow!("malformed STAT reply"))?;
        Ok((count, size))
    }

    pub async fn list(&mut self) -> Result<Vec<(u32, u64)>> {
        self.wire.write_line("LIST").await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("LIST failed: {msg}");
        }
        let body = self.wire.read_multiline().await?;
        parse_numbered_pairs(&body)
    }

    pub async fn uidl(&mut self) -> Result<Vec<(u32, String)>> {
        self.wire.write_line("UIDL").await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("UIDL failed: {msg}");
        }
        let body = self.wire.read_multiline().await?;
        let text = String::from_utf8_lossy(&body);
        let mut out = Vec::new();
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(n), Some(uid)) = (parts.next().and_then(|s| s.parse().ok()), parts.next()) {
                out.push((n, uid.to_string()));
            }
        }
        Ok(out)
    }

    pub async fn retr(&mut self, number: u32) -> Result<Vec<u8>> {
        self.wire.write_line(&format!("RETR {number}")).await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("RETR failed: {msg}");
        }
        self.wire.read_multiline().await
    }

    /// Streams message `number` into `sink` via repeated `on_content`
    /// calls followed by exactly one `on_complete`, instead of buffering
    /// the whole body.
    pub async fn retr_streaming(&mut self, number: u32, mut sink: Box<dyn BodySink>) -> Result<()> {
        self.wire.write_line(&format!("RETR {number}")).await?;
        match self.wire.read_status().await {
            Ok((true, _)) => {}
            Ok((false, msg)) => {
                sink.on_service_closing(StagedError::Protocol(msg));
                return Ok(());
            }
            Err(e) => {
                sink.on_service_closing(StagedError::Protocol(e.to_string()));
                return Ok(());
            }
        }
        match self.wire.stream_multiline(sink.as_mut()).await {
            Ok(()) => {
                sink.on_complete();
                Ok(())
            }
            Err(e) => {
                sink.on_service_closing(StagedError::Protocol(e.to_string()));
                Ok(())
            }
        }
    }

    pub async fn top(&mut self, number: u32, lines: u32) -> Result<Vec<u8>> {
        self.wire.write_line(&format!("TOP {number} {lines}")).await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("TOP failed: {msg}");
        }
        self.wire.read_multiline().await
    }

    pub async fn dele(&mut self, number: u32) -> Result<()> {
        self.wire.write_line(&format!("DELE {number}")).await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("DELE failed: {msg}");
        }
        Ok(())
    }

    pub async fn noop(&mut self) -> Result<()> {
        self.wire.write_line("NOOP").await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("NOOP failed: {msg}");
        }
        Ok(())
    }

    pub async fn rset(&mut self) -> Result<()> {
        self.wire.write_line("RSET").await?;
        let (ok, msg) = self.wire.read_status().await?;
        if !ok {
            bail!("RSET failed: {msg}");
        }
        Ok(())
    }

    pub async fn quit(mut self) -> Result<()> {
        self.wire.write_line("QUIT").await?;
        let _ = self.wire.read_status().await?;
        Ok(())
    }
}

fn parse_numbered_pairs(body: &[u8]) -> Result<Vec<(u32, u64)>> {
    let text = String::from_utf8_lossy(body);
    let mut out = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(n), Some(size)) = (parts.next().and_then(|s| s.parse().ok()), parts.next().and_then(|s| s.parse().ok())) {
            out.push((n, size));
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
