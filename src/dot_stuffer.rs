//! Byte-stuffing/un-stuffing for the dot-terminated body transfer shared by
//! SMTP `DATA` and POP3 multi-line responses (RFC 5321 §4.5.2).
//!
//! A line consisting of a single `.` terminates the transfer. Any line in
//! the body that itself starts with a `.` must have that leading dot
//! doubled on the wire and undoubled again on receipt, so that only the
//! genuine terminator is ever a single, bare dot.

/// Tracks position within the CRLF-delimited stream so stuffing/un-stuffing
/// decisions can be made one byte at a time across arbitrary chunk
/// boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// At the start of a line: the next byte decides whether it needs
    /// (un)stuffing.
    LineStart,
    /// Mid-line, no longer relevant to stuffing.
    Normal,
    /// Just saw a `\r`; a `\n` completes the line and returns to `LineStart`.
    SawCr,
}

/// Applies or removes dot-stuffing to a byte stream incrementally.
///
/// One `DotStuffer` is created per direction per message: `stuff` for
/// outbound bodies (leading dots doubled before they leave the process),
/// `unstuff` for inbound bodies (leading-dot pairs collapsed back to one,
/// and the bare-dot terminator line recognized and excluded from output).
pub struct DotStuffer {
    state: State,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DotStuffer {
    pub fn new() -> Self {
        DotStuffer {
            state: State::LineStart,
        }
    }

    /// Resets the stuffer to its initial state, for reuse across messages.
    pub fn reset(&mut self) {
        self.state = State::LineStart;
    }

    /// Applies dot-stuffing to `chunk`, appending the result to `out`.
    ///
    /// Any line beginning with `.` has that dot doubled. Does not append
    /// the terminating `.\r\n`; call [`DotStuffer::end_message`] once the
    /// body is exhausted.
    pub fn stuff(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for &byte in chunk {
            match self.state {
                State::LineStart => {
                    if byte == b'.' {
                        out.push(b'.');
                    }
                    out.push(byte);
                    self.state = if byte == b'\r' {
                        State::SawCr
                    } else if byte == b'\n' {
                        State::LineStart
                    } else {
                        State::Normal
                    };
                }
                State::Normal => {
                    out.push(byte);
                    if byte == b'\r' {
                        self.state = State::SawCr;
                    } else if byte == b'\n' {
                        self.state = State::LineStart;
                    }
                }
                State::SawCr => {
                    out.push(byte);
                    self.state = if byte == b'\n' {
                        State::LineStart
                    } else if byte == b'\r' {
                        State::SawCr
                    } else {
                        State::Normal
                    };
                }
            }
        }
    }

    /// Appends the terminating `.\r\n` sequence, stuffing a leading dot on
    /// the final partial line first if one is pending (i.e. the body did
    /// not end on a line boundary).
    pub fn end_message(&mut self, out: &mut Vec<u8>) {
        if self.state != State::LineStart {
            out.push(b'\r');
            out.push(b'\n');
        }
        out.push(b'.');
        out.push(b'\r');
        out.push(b'\n');
        self.state = State::LineStart;
    }

    /// Removes dot-stuffing from `line` (a single line, CRLF already
    /// stripped by the caller's line reader).
    ///
    /// Returns `None` if `line` is the bare terminator (`"."`), signalling
    /// end of transfer; otherwise returns the un-stuffed line content.
    pub fn unstuff_line(line: &str) -> Option<&str> {
        if line == "." {
            None
        } else if let Some(rest) = line.strip_prefix('.') {
            Some(rest)
        } else {
            Some(line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuffs_leading_dot_on_body_line() {
        let mut stuffer = DotStuffer::new();
        let mut out = Vec::new();
        stuffer.stuff(b".hidden\r\nplain\r\n", &mut out);
        assert_eq!(out, b"..hidden\r\nplain\r\n");
    }

    #[test]
    fn does_not_stuff_mid_line_dot() {
        let mut stuffer = DotStuffer::new();
        let mut out = Vec::new();
        stuffer.stuff(b"a.b.c\r\n", &mut out);
        assert_eq!(out, b"a.b.c\r\n");
    }

    #[test]
    fn stuffing_is_stable_across_chunk_boundaries() {
        // The same message split at an arbitrary byte must stuff identically
        // to the same message fed in one call.
        let whole = b".leading\r\nmore.stuff\r\n.again\r\n";
        let mut one_shot = DotStuffer::new();
        let mut out_one = Vec::new();
        one_shot.stuff(whole, &mut out_one);

        let mut chunked = DotStuffer::new();
        let mut out_chunked = Vec::new();
        for split in 0..whole.len() {
            chunked.reset();
            out_chunked.clear();
            chunked.stuff(&whole[..split], &mut out_chunked);
            chunked.stuff(&whole[split..], &mut out_chunked);
            assert_eq!(out_chunked, out_one, "split at {split} diverged");
        }
    }

    #[test]
    fn end_message_closes_partial_final_line() {
        let mut stuffer = DotStuffer::new();
        let mut out = Vec::new();
        stuffer.stuff(b"no trailing crlf", &mut out);
        stuffer.end_message(&mut out);
        assert_eq!(out, b"no trailing crlf\r\n.\r\n");
    }

    #[test]
    fn unstuff_line_recognizes_terminator() {
        assert_eq!(DotStuffer::unstuff_line("."), None);
        assert_eq!(DotStuffer::unstuff_line(".."), Some("."));
        assert_eq!(DotStuffer::unstuff_line("plain"), Some("plain"));
    }

    #[test]
    fn round_trip_through_stuff_and_unstuff() {
        let lines = ["Subject: test", ".leading dot line", "plain", "..double"];
        let mut stuffer = DotStuffer::new();
        let mut wire = Vec::new();
        for line in &lines {
            stuffer.stuff(line.as_bytes(), &mut wire);
            stuffer.stuff(b"\r\n", &mut wire);
        }
        stuffer.end_message(&mut wire);

        let text = String::from_utf8(wire).unwrap();
        let mut recovered = Vec::new();
        for wire_line in text.split("\r\n") {
            if wire_line.is_empty() {
                continue;
            }
            match DotStuffer::unstuff_line(wire_line) {
                Some(content) => recovered.push(content.to_string()),
                None => break,
            }
        }
        assert_eq!(recovered, lines);
    }
}
