//! Implements the state machine and command handling logic for the SMTP
//! server side of a connection.
//!
//! This module defines the states of an SMTP conversation (`SmtpState`),
//! manages reading commands and writing responses over a generic
//! reader/writer pair, and parses the command set described in the
//! [`crate::smtp`] module documentation, transitioning the state
//! accordingly.

use anyhow::Result;
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::dot_stuffer::DotStuffer;

/// Represents the possible states during an SMTP session.
///
/// The protocol handler transitions between these states based on the
/// commands received. `Authenticating` and `Data`/`BdatChunk` are
/// sub-states entered by `AUTH` and `DATA`/`BDAT` respectively and always
/// return to `Greeted` (or `MailFrom`/`RcptTo` as appropriate) once the
/// sub-exchange completes.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SmtpState {
    /// Initial state immediately after connection, before any greeting.
    Initial,
    /// After `HELO`/`EHLO`. A `STARTTLS` upgrade returns here, forcing the
    /// client to re-issue `EHLO` before the advertised capabilities (now
    /// reflecting the secured channel) can be trusted.
    Greeted,
    /// Mid-`AUTH` challenge/response exchange.
    Authenticating,
    /// After a valid `MAIL FROM`.
    MailFrom,
    /// After at least one valid `RCPT TO`.
    RcptTo,
    /// Collecting a dot-stuffed `DATA` body.
    Data,
    /// Collecting a `BDAT` chunk stream.
    BdatChunk,
}

/// Manages the state and I/O for a single SMTP client connection.
pub struct SmtpProtocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    reader: R,
    writer: W,
    state: SmtpState,
    dot_stuffer: DotStuffer,
    tls_active: bool,
    size_declared: Option<u64>,
    bytes_received: u64,
    max_message_size: u64,
}

impl<R, W> SmtpProtocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    pub fn new(reader: R, writer: W, max_message_size: u64) -> Self {
        SmtpProtocol {
            reader,
            writer,
            state: SmtpState::Initial,
            dot_stuffer: DotStuffer::new(),
            tls_active: false,
            size_declared: None,
            bytes_received: 0,
            max_message_size,
        }
    }

    /// Sends the initial SMTP greeting (220) to the client.
    pub async fn send_greeting(&mut self) -> Result<()> {
        self.write_line("220 staged-net SMTP server ready").await
    }

    /// Marks the connection as secured, following a completed STARTTLS
    /// handshake. The caller is responsible for actually swapping the
    /// underlying stream; this only affects which capabilities get
    /// advertised on the next `EHLO`.
    pub fn mark_tls_active(&mut self) {
        self.tls_active = true;
    }

    fn ehlo_response(&self, domain: &str, auth_mechanisms: &[String], tls_available: bool) -> Vec<String> {
        let mut lines = vec![format!("staged-net greets {domain}")];
        lines.push(format!("SIZE {}", self.max_message_size));
        lines.push("PIPELINING".to_string());
        lines.push("8BITMIME".to_string());
        lines.push("SMTPUTF8".to_string());
        lines.push("CHUNKING".to_string());
        if tls_available && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        if !auth_mechanisms.is_empty() {
            lines.push(format!("AUTH {}", auth_mechanisms.join(" ")));
        }
        lines
    }

    /// Processes a single command line received from the client.
    pub async fn process_command(
        &mut self,
        line: &str,
        auth_mechanisms: &[String],
        tls_available: bool,
    ) -> Result<SmtpCommandResult> {
        debug!("SMTP({:?}): processing {:?}", self.state, line);

        match self.state {
            SmtpState::Initial | SmtpState::Greeted => self.process_greeted(line, auth_mechanisms, tls_available).await,
            SmtpState::Authenticating => self.process_authenticating(line).await,
            SmtpState::MailFrom => self.process_mail_from_state(line).await,
            SmtpState::RcptTo => self.process_rcpt_to_state(line).await,
            SmtpState::Data => self.process_data(line).await,
            SmtpState::BdatChunk => self.process_bdat(line).await,
        }
    }

    async fn process_greeted(
        &mut self,
        line: &str,
        auth_mechanisms: &[String],
        tls_available: bool,
    ) -> Result<SmtpCommandResult> {
        let upper = line.to_uppercase();
        if upper.starts_with("EHLO") {
            let domain = line.split_whitespace().nth(1).unwrap_or("client");
            let capability_lines = self.ehlo_response(domain, auth_mechanisms, tls_available);
            let last = capability_lines.len() - 1;
            for (i, cap) in capability_lines.iter().enumerate() {
                let sep = if i == last { ' ' } else { '-' };
                self.write_line(&format!("250{sep}{cap}")).await?;
            }
            self.state = SmtpState::Greeted;
            Ok(SmtpCommandResult::Continue)
        } else if upper.starts_with("HELO") {
            let domain = line.split_whitespace().nth(1).unwrap_or("client");
            self.write_line(&format!("250 staged-net greets {domain}")).await?;
            self.state = SmtpState::Greeted;
            Ok(SmtpCommandResult::Continue)
        } else if upper.starts_with("STARTTLS") {
            if !tls_available || self.tls_active {
                self.write_line("454 TLS not available").await?;
                return Ok(SmtpCommandResult::Continue);
            }
            self.write_line("220 Go ahead").await?;
            Ok(SmtpCommandResult::StartTls)
        } else if upper.starts_with("AUTH") {
            let mechanism = line.split_whitespace().nth(1).unwrap_or("").to_uppercase();
            if !auth_mechanisms.iter().any(|m| m == &mechanism) {
                self.write_line("504 Unrecognized authentication mechanism").await?;
                return Ok(SmtpCommandResult::Continue);
            }
            let initial = line.split_whitespace().nth(2).map(|s| s.to_string());
            self.state = SmtpState::Authenticating;
            Ok(SmtpCommandResult::AuthStart { mechanism, initial })
        } else if upper.starts_with("MAIL FROM:") {
            if let Some(email) = extract_email(line) {
                self.size_declared = extract_size_param(line);
                if let Some(declared) = self.size_declared {
                    if declared > self.max_message_size {
                        self.write_line("552 Message size exceeds fixed maximum message size").await?;
                        return Ok(SmtpCommandResult::Continue);
                    }
                }
                self.write_line("250 OK").await?;
                self.state = SmtpState::MailFrom;
                Ok(SmtpCommandResult::MailFrom(email))
            } else {
                self.write_line("501 Syntax error in MAIL FROM parameters").await?;
                Ok(SmtpCommandResult::Continue)
            }
        } else if upper.starts_with("VRFY") || upper.starts_with("EXPN") {
            self.write_line("252 Cannot VRFY user, but will accept message").await?;
            Ok(SmtpCommandResult::Continue)
        } else if upper.starts_with("NOOP") {
            self.write_line("250 OK").await?;
            Ok(SmtpCommandResult::Continue)
        } else if upper.starts_with("RSET") {
            self.reset_transaction();
            self.write_line("250 OK").await?;
            Ok(SmtpCommandResult::Continue)
        } else if upper.starts_with("QUIT") {
            self.write_line("221 Bye").await?;
            Ok(SmtpCommandResult::Quit)
        } else {
            self.write_line("500 Command not recognized or out of sequence").await?;
            Ok(SmtpCommandResult::Continue)
        }
    }

    async fn process_authenticating(&mut self, line: &str) -> Result<SmtpCommandResult> {
        if line == "*" {
            self.write_line("501 Authentication cancelled").await?;
            self.state = SmtpState::Greeted;
            return Ok(SmtpCommandResult::Continue);
        }
        Ok(SmtpCommandResult::AuthResponse(line.to_string()))
    }

    /// Called by the connection driver once it has evaluated an
    /// [`SmtpCommandResult::AuthStart`] or [`SmtpCommandResult::AuthResponse`]
    /// against the configured auth backend.
    pub async fn finish_auth(&mut self, outcome: AuthOutcome) -> Result<()> {
        match outcome {
            AuthOutcome::Success => {
                self.write_line("235 Authentication successful").await?;
                self.state = SmtpState::Greeted;
            }
            AuthOutcome::ChallengeContinue(challenge_b64) => {
                self.write_line(&format!("334 {challenge_b64}")).await?;
                // remains Authenticating
            }
            AuthOutcome::Failure => {
                self.write_line("535 Authentication credentials invalid").await?;
                self.state = SmtpState::Greeted;
            }
        }
        Ok(())
    }

    async fn process_mail_from_state(&mut self, line: &str) -> Result<SmtpCommandResult> {
        let upper = line.to_uppercase();
        if upper.starts_with("RCPT TO:") {
            if let Some(email) = extract_email(line) {
                // State advances to RcptTo only once the driver confirms the
                // policy accepted this recipient, via `accept_rcpt`; a reject
                // must leave the envelope in MailFrom (no accepted
                // recipients yet), so DATA/BDAT stay illegal.
                Ok(SmtpCommandResult::RcptTo(email))
            } else {
                self.write_line("501 Syntax error in RCPT TO parameters").await?;
                Ok(SmtpCommandResult::Continue)
            }
        } else if upper.starts_with("RSET") {
            self.reset_transaction();
            self.write_line("250 OK").await?;
            Ok(SmtpCommandResult::Continue)
        } else if upper.starts_with("QUIT") {
            self.write_line("221 Bye").await?;
            Ok(SmtpCommandResult::Quit)
        } else {
            self.write_line("503 Bad sequence of commands (expected RCPT TO)").await?;
            Ok(SmtpCommandResult::Continue)
        }
    }

    async fn process_rcpt_to_state(&mut self, line: &str) -> Result<SmtpCommandResult> {
        let upper = line.to_uppercase();
        if upper.starts_with("DATA") {
            self.write_line("354 Start mail input; end with <CRLF>.<CRLF>").await?;
            self.state = SmtpState::Data;
            self.dot_stuffer.reset();
            self.bytes_received = 0;
            Ok(SmtpCommandResult::DataStart)
        } else if upper.starts_with("BDAT") {
            self.handle_bdat_header(line).await
        } else if upper.starts_with("RCPT TO:") {
            if let Some(email) = extract_email(line) {
                Ok(SmtpCommandResult::RcptTo(email))
            } else {
                self.write_line("501 Syntax error in RCPT TO parameters").await?;
                Ok(SmtpCommandResult::Continue)
            }
        } else if upper.starts_with("RSET") {
            self.reset_transaction();
            self.write_line("250 OK").await?;
            Ok(SmtpCommandResult::Continue)
        } else if upper.starts_with("QUIT") {
            self.write_line("221 Bye").await?;
            Ok(SmtpCommandResult::Quit)
        } else {
            self.write_line("503 Bad sequence of commands (expected DATA, BDAT or RCPT TO)").await?;
            Ok(SmtpCommandResult::Continue)
        }
    }

    /// Called by the connection driver once a [`SmtpCommandResult::RcptTo`]
    /// recipient has been accepted by the application's policy. Only here
    /// does the state machine advance to `RcptTo` (Envelope → Recipients);
    /// a rejected recipient must leave the state unchanged so `DATA`/`BDAT`
    /// remain illegal until at least one recipient is actually accepted.
    pub async fn accept_rcpt(&mut self) -> Result<()> {
        self.write_line("250 OK").await?;
        self.state = SmtpState::RcptTo;
        Ok(())
    }

    /// Called by the connection driver when the application's policy
    /// rejects a recipient. Writes the given reply code and leaves the
    /// state untouched: `MailFrom` if no recipient has been accepted yet,
    /// or `RcptTo` if this rejection follows at least one acceptance.
    pub async fn reject_rcpt(&mut self, reply: &str) -> Result<()> {
        self.write_line(reply).await
    }

    async fn handle_bdat_header(&mut self, line: &str) -> Result<SmtpCommandResult> {
        let mut parts = line.split_whitespace();
        parts.next(); // "BDAT"
        let size: u64 = match parts.next().and_then(|s| s.parse().ok()) {
            Some(n) => n,
            None => {
                self.write_line("501 Syntax error in BDAT size argument").await?;
                return Ok(SmtpCommandResult::Continue);
            }
        };
        let is_last = matches!(parts.next(), Some(tok) if tok.eq_ignore_ascii_case("LAST"));
        self.state = SmtpState::BdatChunk;
        Ok(SmtpCommandResult::BdatHeader { size, is_last })
    }

    async fn process_data(&mut self, line: &str) -> Result<SmtpCommandResult> {
        match DotStuffer::unstuff_line(line) {
            None => {
                self.write_line("250 OK: Message accepted for delivery").await?;
                self.state = SmtpState::Greeted;
                Ok(SmtpCommandResult::DataEnd)
            }
            Some(content) => {
                self.bytes_received += content.len() as u64 + 2;
                if self.bytes_received > self.max_message_size {
                    self.write_line("552 Message size exceeds fixed maximum message size").await?;
                    self.state = SmtpState::Greeted;
                    return Ok(SmtpCommandResult::DataEnd);
                }
                Ok(SmtpCommandResult::DataLine(content.to_string()))
            }
        }
    }

    /// Acknowledges a `BDAT` chunk once the connection driver has read
    /// exactly `size` raw bytes following the header line.
    pub async fn acknowledge_bdat(&mut self, is_last: bool) -> Result<()> {
        if is_last {
            self.write_line("250 OK: Message accepted for delivery").await?;
            self.state = SmtpState::Greeted;
        } else {
            self.write_line("250 OK: chunk accepted").await?;
            self.state = SmtpState::RcptTo;
        }
        Ok(())
    }

    async fn process_bdat(&mut self, line: &str) -> Result<SmtpCommandResult> {
        // Only reached if a line-oriented command arrives instead of the raw
        // chunk the driver should be reading directly from the stream.
        let upper = line.to_uppercase();
        if upper.starts_with("QUIT") {
            self.write_line("221 Bye").await?;
            Ok(SmtpCommandResult::Quit)
        } else {
            self.write_line("503 Expected BDAT chunk data").await?;
            Ok(SmtpCommandResult::Continue)
        }
    }

    fn reset_transaction(&mut self) {
        self.state = SmtpState::Greeted;
        self.size_declared = None;
        self.bytes_received = 0;
        self.dot_stuffer.reset();
    }

    /// Reads a single line (terminated by CRLF) from the client stream.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut buffer = String::new();
        let bytes_read = self.reader.read_line(&mut buffer).await?;
        if bytes_read == 0 {
            Ok(String::new())
        } else {
            let line = buffer.trim_end_matches(['\r', '\n']).to_string();
            debug!("SMTP read: {line}");
            Ok(line)
        }
    }

    /// Reads exactly `len` raw bytes, for `BDAT` chunk bodies (which are not
    /// line-delimited and may contain arbitrary bytes including CRLF).
    pub async fn read_exact_bytes(&mut self, len: u64) -> Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; len as usize];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Writes a single line (appending CRLF) to the client stream.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("SMTP write: {line}");
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn get_state(&self) -> SmtpState {
        self.state
    }

    /// Tears the handler down into its raw reader/writer halves, discarding
    /// negotiated session state. Used by the STARTTLS upgrade: per RFC 3207
    /// the whole session is forgotten except the peer address, so there is
    /// nothing worth carrying over besides the bytes already buffered.
    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

/// Extracts an email address enclosed in angle brackets (`< >`) from a
/// command line.
fn extract_email(line: &str) -> Option<String> {
    let start = line.find('<');
    let end = line.find('>');
    match (start, end) {
        (Some(s), Some(e)) if s < e => Some(line[s + 1..e].to_string()),
        _ => None,
    }
}

/// Extracts the `SIZE=` parameter from a `MAIL FROM` line, if present.
fn extract_size_param(line: &str) -> Option<u64> {
    line.split_whitespace()
        .find_map(|tok| tok.to_uppercase().strip_prefix("SIZE=").and_then(|v| v.parse().ok()))
}

/// Outcome of evaluating an AUTH exchange against whatever credential
/// backend the application supplies.
#[derive(Debug)]
pub enum AuthOutcome {
    Success,
    /// Carries the next base64-encoded challenge to send to the client.
    ChallengeContinue(String),
    Failure,
}

/// Represents the outcome of processing a single SMTP command line.
#[derive(Debug)]
pub enum SmtpCommandResult {
    Continue,
    Quit,
    MailFrom(String),
    RcptTo(String),
    DataStart,
    DataLine(String),
    DataEnd,
    StartTls,
    AuthStart { mechanism: String, initial: Option<String> },
    AuthResponse(String),
    BdatHeader { size: u64, is_last: bool },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
