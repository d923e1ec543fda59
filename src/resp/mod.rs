//! Streaming RESP (REdis Serialization Protocol) codec: an incremental
//! decoder that tolerates arbitrary chunk boundaries by rolling back to a
//! saved cursor on an incomplete parse, and an encoder producing the
//! array-of-bulk-strings wire form commands are sent in.
//!
//! `Frame` distinguishes a null bulk string/array from an empty one, since
//! RESP gives them different wire representations (`$-1\r\n` vs `$0\r\n\r\n`,
//! `*-1\r\n` vs `*0\r\n`) and callers need to tell them apart.

use bytes::{Buf, BytesMut};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    NullBulk,
    Array(Vec<Frame>),
    NullArray,
}

#[derive(Debug)]
pub enum RespError {
    /// The buffer does not yet contain a full frame; more bytes are needed.
    Incomplete,
    Malformed(String),
}

impl fmt::Display for RespError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespError::Incomplete => write!(f, "incomplete frame"),
            RespError::Malformed(msg) => write!(f, "malformed frame: {msg}"),
        }
    }
}

impl std::error::Error for RespError {}

/// Incremental decoder holding a persistent parse cursor across calls so a
/// frame split over multiple reads (or multiple pipelined frames in one
/// read) is always decoded correctly regardless of where the chunk
/// boundaries fall.
/// Default ceiling on an inline (non-bulk) line, matching Redis's own
/// `PROTO_INLINE_MAX_SIZE`. A line awaiting its terminating CRLF past this
/// length is a format error rather than treated as merely incomplete.
pub const DEFAULT_INLINE_LIMIT: usize = 65536;

pub struct Decoder {
    buffer: BytesMut,
    inline_limit: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder { buffer: BytesMut::new(), inline_limit: DEFAULT_INLINE_LIMIT }
    }

    /// Builds a decoder with a non-default ceiling on inline line length.
    pub fn with_inline_limit(inline_limit: usize) -> Self {
        Decoder { buffer: BytesMut::new(), inline_limit }
    }

    /// Feeds newly-received bytes into the decoder's retained buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Attempts to decode one frame from the retained buffer.
    ///
    /// On success, the consumed bytes are dropped from the buffer and the
    /// frame is returned. On [`RespError::Incomplete`], the buffer is left
    /// untouched so a subsequent `feed` + `next_frame` call can pick up
    /// where this one left off.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, RespError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor { data: &self.buffer, pos: 0, inline_limit: self.inline_limit };
        match parse_frame(&mut cursor) {
            Ok(frame) => {
                let consumed = cursor.pos;
                self.buffer.advance(consumed);
                Ok(Some(frame))
            }
            Err(RespError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    inline_limit: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Reads up to (not including) the next CRLF, advancing past it.
    /// Returns `Incomplete` if no CRLF is present yet within `inline_limit`
    /// bytes, and a format error if it never arrives within that ceiling.
    fn read_line(&mut self) -> Result<&'a [u8], RespError> {
        let rest = self.remaining();
        match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                if nl == 0 || rest[nl - 1] != b'\r' {
                    return Err(RespError::Malformed("line not terminated by CRLF".into()));
                }
                let line = &rest[..nl - 1];
                self.pos += nl + 1;
                Ok(line)
            }
            None if rest.len() > self.inline_limit => {
                Err(RespError::Malformed(format!("line exceeds inline limit of {} bytes", self.inline_limit)))
            }
            None => Err(RespError::Incomplete),
        }
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8], RespError> {
        let rest = self.remaining();
        if rest.len() < len {
            return Err(RespError::Incomplete);
        }
        let out = &rest[..len];
        self.pos += len;
        Ok(out)
    }
}

fn parse_frame(cursor: &mut Cursor<'_>) -> Result<Frame, RespError> {
    let rest = cursor.remaining();
    if rest.is_empty() {
        return Err(RespError::Incomplete);
    }
    let tag = rest[0];
    cursor.pos += 1;

    match tag {
        b'+' => {
            let line = cursor.read_line()?;
            Ok(Frame::Simple(to_utf8(line)?))
        }
        b'-' => {
            let line = cursor.read_line()?;
            Ok(Frame::Error(to_utf8(line)?))
        }
        b':' => {
            let line = cursor.read_line()?;
            let n = to_utf8(line)?
                .parse::<i64>()
                .map_err(|e| RespError::Malformed(format!("bad integer: {e}")))?;
            Ok(Frame::Integer(n))
        }
        b'$' => {
            let line = cursor.read_line()?;
            let len = to_utf8(line)?
                .parse::<i64>()
                .map_err(|e| RespError::Malformed(format!("bad bulk length: {e}")))?;
            if len < 0 {
                return Ok(Frame::NullBulk);
            }
            let data = cursor.read_exact(len as usize)?.to_vec();
            // trailing CRLF
            let crlf = cursor.read_exact(2)?;
            if crlf != b"\r\n" {
                return Err(RespError::Malformed("bulk string missing trailing CRLF".into()));
            }
            Ok(Frame::Bulk(data))
        }
        b'*' => {
            let line = cursor.read_line()?;
            let len = to_utf8(line)?
                .parse::<i64>()
                .map_err(|e| RespError::Malformed(format!("bad array length: {e}")))?;
            if len < 0 {
                return Ok(Frame::NullArray);
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(parse_frame(cursor)?);
            }
            Ok(Frame::Array(items))
        }
        other => Err(RespError::Malformed(format!("unknown type byte {other:#x}"))),
    }
}

fn to_utf8(bytes: &[u8]) -> Result<String, RespError> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|e| RespError::Malformed(format!("invalid utf-8: {e}")))
}

/// Parses an inline command (a plain CRLF-terminated line of
/// whitespace-separated arguments, no `*`/`$` framing), as accepted by
/// Redis for interactive use. Returns `Incomplete` if no full line is
/// buffered yet.
pub fn parse_inline(cursor_bytes: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>, RespError> {
    if let Some(nl) = cursor_bytes.iter().position(|&b| b == b'\n') {
        let end = if nl > 0 && cursor_bytes[nl - 1] == b'\r' { nl - 1 } else { nl };
        let line = &cursor_bytes[..end];
        let args = line
            .split(|&b| b == b' ')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_vec())
            .collect();
        Ok(Some((args, nl + 1)))
    } else {
        Ok(None)
    }
}

/// Encodes frames to their RESP wire representation.
pub struct Encoder;

impl Encoder {
    /// Encodes a command as an array of bulk strings, the canonical form a
    /// Redis client sends regardless of the server's own reply encoding.
    pub fn encode_command(args: &[impl AsRef<[u8]>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            let bytes = arg.as_ref();
            out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    pub fn encode(frame: &Frame) -> Vec<u8> {
        let mut out = Vec::new();
        Self::encode_into(frame, &mut out);
        out
    }

    fn encode_into(frame: &Frame, out: &mut Vec<u8>) {
        match frame {
            Frame::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                out.extend_from_slice(format!(":{n}\r\n").as_bytes());
            }
            Frame::Bulk(data) => {
                out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Frame::NullBulk => out.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    Self::encode_into(item, out);
                }
            }
            Frame::NullArray => out.extend_from_slice(b"*-1\r\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_string() {
        let mut decoder = Decoder::new();
        decoder.feed(b"+OK\r\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Simple("OK".into())));
    }

    #[test]
    fn decodes_null_bulk_distinctly_from_empty_bulk() {
        let mut decoder = Decoder::new();
        decoder.feed(b"$-1\r\n$0\r\n\r\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::NullBulk));
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Bulk(Vec::new())));
    }

    #[test]
    fn decodes_null_array_distinctly_from_empty_array() {
        let mut decoder = Decoder::new();
        decoder.feed(b"*-1\r\n*0\r\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::NullArray));
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Array(Vec::new())));
    }

    #[test]
    fn incomplete_frame_is_preserved_across_feeds() {
        let mut decoder = Decoder::new();
        decoder.feed(b"*2\r\n$3\r\nfoo\r\n$");
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.feed(b"3\r\nbar\r\n");
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![Frame::Bulk(b"foo".to_vec()), Frame::Bulk(b"bar".to_vec())])
        );
    }

    #[test]
    fn decoding_is_stable_across_arbitrary_chunk_splits() {
        let whole = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".to_vec();
        let expected = Frame::Array(vec![
            Frame::Bulk(b"SET".to_vec()),
            Frame::Bulk(b"foo".to_vec()),
            Frame::Bulk(b"bar".to_vec()),
        ]);
        for split in 0..whole.len() {
            let mut decoder = Decoder::new();
            decoder.feed(&whole[..split]);
            assert!(decoder.next_frame().unwrap().is_none(), "split at {split} decoded early");
            decoder.feed(&whole[split..]);
            assert_eq!(decoder.next_frame().unwrap().unwrap(), expected, "split at {split}");
        }
    }

    #[test]
    fn pipelined_frames_decode_one_at_a_time() {
        let mut decoder = Decoder::new();
        decoder.feed(b"+OK\r\n+ALSO OK\r\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Simple("OK".into())));
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Simple("ALSO OK".into())));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn overlong_line_without_crlf_is_a_format_error_not_incomplete() {
        let mut decoder = Decoder::with_inline_limit(16);
        decoder.feed(b"+this line has no terminator and is too long for the limit");
        assert!(matches!(decoder.next_frame(), Err(RespError::Malformed(_))));
    }

    #[test]
    fn encodes_command_as_array_of_bulk_strings() {
        let encoded = Encoder::encode_command(&["SET", "foo", "bar"]);
        assert_eq!(encoded, b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
    }

    #[test]
    fn inline_command_parses_space_separated_args() {
        let (args, consumed) = parse_inline(b"PING hello\r\nrest").unwrap().unwrap();
        assert_eq!(args, vec![b"PING".to_vec(), b"hello".to_vec()]);
        assert_eq!(consumed, 13);
    }
}
