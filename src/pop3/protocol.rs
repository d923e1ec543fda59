//! POP3 server state machine (RFC 1939): `Authorization` → `Transaction` →
//! `Update`, plus the `APOP`/`USER`+`PASS` authentication sub-states and
//! the `STLS` upgrade.

use anyhow::Result;
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

/// Possible POP3 session states.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Pop3State {
    /// Before authentication. `USER`/`PASS` or `APOP` are legal here.
    Authorization,
    /// `USER` accepted; server is holding a "soft state" username awaiting
    /// `PASS` (RFC 1939 §7). Any command other than `PASS`/`QUIT` aborts
    /// back to `Authorization`.
    AwaitingPassword,
    /// Mid-`AUTH` challenge/response exchange (RFC 1734/5034).
    Authenticating,
    /// Authenticated; mailbox commands (`STAT`, `LIST`, `RETR`, ...) legal.
    Transaction,
}

pub struct Pop3Protocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    reader: R,
    writer: W,
    state: Pop3State,
    pending_username: Option<String>,
    tls_active: bool,
}

impl<R, W> Pop3Protocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Pop3Protocol {
            reader,
            writer,
            state: Pop3State::Authorization,
            pending_username: None,
            tls_active: false,
        }
    }

    /// Sends the greeting, including the `APOP` challenge banner (e.g.
    /// `<1896.697170952@dbc.mtview.ca.us>`) the client will hash for APOP.
    pub async fn send_greeting(&mut self, apop_banner: &str) -> Result<()> {
        self.write_line(&format!("+OK staged-net POP3 server ready {apop_banner}")).await
    }

    pub fn mark_tls_active(&mut self) {
        self.tls_active = true;
    }

    pub async fn process_command(&mut self, line: &str, tls_available: bool, auth_mechanisms: &[String]) -> Result<Pop3CommandResult> {
        debug!("POP3({:?}): processing {line:?}", self.state);
        match self.state {
            Pop3State::Authorization => self.process_authorization(line, tls_available, auth_mechanisms).await,
            Pop3State::AwaitingPassword => self.process_awaiting_password(line).await,
            Pop3State::Authenticating => self.process_authenticating(line).await,
            Pop3State::Transaction => self.process_transaction(line).await,
        }
    }

    async fn process_authorization(&mut self, line: &str, tls_available: bool, auth_mechanisms: &[String]) -> Result<Pop3CommandResult> {
        let upper = line.to_uppercase();
        if upper.starts_with("AUTH ") || upper == "AUTH" {
            let mut parts = line.split_whitespace();
            parts.next(); // "AUTH"
            let mechanism = match parts.next() {
                Some(m) => m.to_uppercase(),
                None => {
                    self.write_line("-ERR missing SASL mechanism").await?;
                    return Ok(Pop3CommandResult::Continue);
                }
            };
            if !auth_mechanisms.iter().any(|m| m == &mechanism) {
                self.write_line("-ERR unrecognized authentication mechanism").await?;
                return Ok(Pop3CommandResult::Continue);
            }
            let initial = parts.next().map(|s| s.to_string());
            self.state = Pop3State::Authenticating;
            Ok(Pop3CommandResult::AuthStart { mechanism, initial })
        } else if let Some(user) = upper.strip_prefix("USER ") {
            let username = line[5..].trim().to_string();
            let _ = user;
            self.pending_username = Some(username.clone());
            self.write_line("+OK password required").await?;
            self.state = Pop3State::AwaitingPassword;
            Ok(Pop3CommandResult::Continue)
        } else if let Some(rest) = line.strip_prefix("APOP ").or_else(|| line.strip_prefix("apop ")) {
            let mut parts = rest.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(user), Some(digest)) => Ok(Pop3CommandResult::Apop {
                    username: user.to_string(),
                    digest: digest.to_string(),
                }),
                _ => {
                    self.write_line("-ERR malformed APOP command").await?;
                    Ok(Pop3CommandResult::Continue)
                }
            }
        } else if upper.starts_with("STLS") {
            if !tls_available || self.tls_active {
                self.write_line("-ERR TLS not available").await?;
                return Ok(Pop3CommandResult::Continue);
            }
            self.write_line("+OK begin TLS negotiation").await?;
            Ok(Pop3CommandResult::Stls)
        } else if upper.starts_with("CAPA") {
            Ok(Pop3CommandResult::Capa)
        } else if upper.starts_with("QUIT") {
            self.write_line("+OK bye").await?;
            Ok(Pop3CommandResult::Quit)
        } else {
            self.write_line("-ERR command not valid before authentication").await?;
            Ok(Pop3CommandResult::Continue)
        }
    }

    async fn process_awaiting_password(&mut self, line: &str) -> Result<Pop3CommandResult> {
        let upper = line.to_uppercase();
        if let Some(password) = upper.strip_prefix("PASS ") {
            let password = line[5..].trim().to_string();
            let _ = password;
            let username = self.pending_username.take().unwrap_or_default();
            Ok(Pop3CommandResult::Pass {
                username,
                password: line[5..].trim().to_string(),
            })
        } else if upper.starts_with("QUIT") {
            self.write_line("+OK bye").await?;
            Ok(Pop3CommandResult::Quit)
        } else {
            self.write_line("-ERR expected PASS").await?;
            self.state = Pop3State::Authorization;
            self.pending_username = None;
            Ok(Pop3CommandResult::Continue)
        }
    }

    async fn process_authenticating(&mut self, line: &str) -> Result<Pop3CommandResult> {
        if line == "*" {
            self.write_line("-ERR authentication cancelled").await?;
            self.state = Pop3State::Authorization;
            return Ok(Pop3CommandResult::Continue);
        }
        Ok(Pop3CommandResult::AuthResponse(line.to_string()))
    }

    /// Sends the next base64 SASL challenge; the exchange remains in
    /// `Authenticating` awaiting the client's response.
    pub async fn send_auth_challenge(&mut self, challenge_b64: &str) -> Result<()> {
        self.write_line(&format!("+ {challenge_b64}")).await
    }

    /// Called by the connection driver when an `AUTH` exchange fails or
    /// names an unsupported mechanism; returns the session to
    /// `Authorization` so the client may retry.
    pub async fn fail_auth(&mut self, message: &str) -> Result<()> {
        self.write_line(message).await?;
        self.state = Pop3State::Authorization;
        Ok(())
    }

    /// Called by the connection driver once USER/PASS, APOP, or AUTH has
    /// been checked against the mailbox backend.
    pub fn complete_authentication(&mut self, success: bool) {
        self.state = if success { Pop3State::Transaction } else { Pop3State::Authorization };
    }

    async fn process_transaction(&mut self, line: &str) -> Result<Pop3CommandResult> {
        let upper = line.to_uppercase();
        if upper.starts_with("STAT") {
            Ok(Pop3CommandResult::Stat)
        } else if let Some(rest) = upper.strip_prefix("LIST") {
            Ok(Pop3CommandResult::List(parse_optional_index(rest)))
        } else if let Some(rest) = upper.strip_prefix("UIDL") {
            Ok(Pop3CommandResult::Uidl(parse_optional_index(rest)))
        } else if let Some(rest) = upper.strip_prefix("RETR ") {
            match rest.trim().parse::<u32>() {
                Ok(n) => Ok(Pop3CommandResult::Retr(n)),
                Err(_) => {
                    self.write_line("-ERR invalid message number").await?;
                    Ok(Pop3CommandResult::Continue)
                }
            }
        } else if let Some(rest) = upper.strip_prefix("DELE ") {
            match rest.trim().parse::<u32>() {
                Ok(n) => Ok(Pop3CommandResult::Dele(n)),
                Err(_) => {
                    self.write_line("-ERR invalid message number").await?;
                    Ok(Pop3CommandResult::Continue)
                }
            }
        } else if let Some(rest) = upper.strip_prefix("TOP ") {
            let mut parts = rest.split_whitespace();
            match (parts.next().and_then(|s| s.parse::<u32>().ok()), parts.next().and_then(|s| s.parse::<u32>().ok())) {
                (Some(n), Some(lines)) => Ok(Pop3CommandResult::Top(n, lines)),
                _ => {
                    self.write_line("-ERR usage: TOP msg lines").await?;
                    Ok(Pop3CommandResult::Continue)
                }
            }
        } else if upper.starts_with("NOOP") {
            self.write_line("+OK").await?;
            Ok(Pop3CommandResult::Continue)
        } else if upper.starts_with("RSET") {
            Ok(Pop3CommandResult::Rset)
        } else if upper.starts_with("CAPA") {
            Ok(Pop3CommandResult::Capa)
        } else if upper.starts_with("QUIT") {
            self.write_line("+OK bye").await?;
            self.state = Pop3State::Authorization;
            Ok(Pop3CommandResult::Quit)
        } else {
            self.write_line("-ERR unknown command").await?;
            Ok(Pop3CommandResult::Continue)
        }
    }

    pub async fn read_line(&mut self) -> Result<String> {
        let mut buffer = String::new();
        let n = self.reader.read_line(&mut buffer).await?;
        if n == 0 {
            Ok(String::new())
        } else {
            Ok(buffer.trim_end_matches(['\r', '\n']).to_string())
        }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Writes a multi-line response body, dot-stuffing it and appending the
    /// `.` terminator.
    pub async fn write_multiline(&mut self, body: &[u8]) -> Result<()> {
        let mut stuffer = crate::dot_stuffer::DotStuffer::new();
        let mut out = Vec::with_capacity(body.len() + 8);
        stuffer.stuff(body, &mut out);
        stuffer.end_message(&mut out);
        self.writer.write_all(&out).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn get_state(&self) -> Pop3State {
        self.state
    }

    pub fn is_tls_active(&self) -> bool {
        self.tls_active
    }

    /// Tears the handler down into its raw reader/writer halves, discarding
    /// negotiated session state. Used by the STLS upgrade, after which the
    /// client is expected to re-issue CAPA over the secured channel.
    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

fn parse_optional_index(rest: &str) -> Option<u32> {
    rest.trim().parse().ok()
}

#[derive(Debug)]
pub enum Pop3CommandResult {
    Continue,
    Quit,
    Apop { username: String, digest: String },
    Pass { username: String, password: String },
    Stat,
    List(Option<u32>),
    Uidl(Option<u32>),
    Retr(u32),
    Dele(u32),
    Top(u32, u32),
    Rset,
    Capa,
    Stls,
    AuthStart { mechanism: String, initial: Option<String> },
    AuthResponse(String),
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
