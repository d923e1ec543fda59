//! DNS wire format (RFC 1035): the 12-byte header, questions, and resource
//! records, including compressed-label decoding on the way in.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_CNAME: u16 = 5;
pub const QCLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_TC: u16 = 0x0200;
const RCODE_MASK: u16 = 0x000f;
const MAX_COMPRESSION_JUMPS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
    /// Offset of `rdata` within the message that carried this record, so a
    /// `CNAME`'s target name (which may use compression pointing earlier in
    /// the message) can be re-decoded correctly.
    rdata_offset: usize,
}

impl ResourceRecord {
    /// Interprets `rdata` as an A or AAAA address, if the record's type says
    /// it is one.
    pub fn address(&self) -> Option<std::net::IpAddr> {
        match (self.rtype, self.rdata.len()) {
            (QTYPE_A, 4) => Some(Ipv4Addr::new(self.rdata[0], self.rdata[1], self.rdata[2], self.rdata[3]).into()),
            (QTYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.rdata);
                Some(Ipv6Addr::from(octets).into())
            }
            _ => None,
        }
    }

    /// Interprets `rdata` as a `CNAME` target, decoding any name compression
    /// relative to the original message bytes this record was decoded from.
    pub fn cname_target(&self, message: &[u8]) -> Option<String> {
        if self.rtype != QTYPE_CNAME {
            return None;
        }
        read_name(message, self.rdata_offset).ok().map(|(name, _)| name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }

    /// Builds a standard recursive query for `name`/`qtype`/`IN`.
    pub fn query(id: u16, name: &str, qtype: u16) -> Message {
        Message {
            id,
            flags: FLAG_RD,
            questions: vec![Question {
                name: name.to_string(),
                qtype,
                qclass: QCLASS_IN,
            }],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.authorities.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.additionals.len() as u16).to_be_bytes());
        for q in &self.questions {
            write_name(&mut out, &q.name);
            out.extend_from_slice(&q.qtype.to_be_bytes());
            out.extend_from_slice(&q.qclass.to_be_bytes());
        }
        for group in [&self.answers, &self.authorities, &self.additionals] {
            for rr in group {
                write_name(&mut out, &rr.name);
                out.extend_from_slice(&rr.rtype.to_be_bytes());
                out.extend_from_slice(&rr.rclass.to_be_bytes());
                out.extend_from_slice(&rr.ttl.to_be_bytes());
                out.extend_from_slice(&(rr.rdata.len() as u16).to_be_bytes());
                out.extend_from_slice(&rr.rdata);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Message, WireError> {
        if buf.len() < 12 {
            return Err(WireError::Truncated);
        }
        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
        let ancount = u16::from_be_bytes([buf[6], buf[7]]);
        let nscount = u16::from_be_bytes([buf[8], buf[9]]);
        let arcount = u16::from_be_bytes([buf[10], buf[11]]);

        let mut offset = 12;
        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let (name, next) = read_name(buf, offset)?;
            offset = next;
            let (qtype, qclass) = read_type_class(buf, offset)?;
            offset += 4;
            questions.push(Question { name, qtype, qclass });
        }

        let mut read_rr_section = |count: u16, offset: &mut usize| -> Result<Vec<ResourceRecord>, WireError> {
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (name, next) = read_name(buf, *offset)?;
                *offset = next;
                let (rtype, rclass) = read_type_class(buf, *offset)?;
                *offset += 4;
                let ttl = read_u32(buf, *offset)?;
                *offset += 4;
                let rdlength = read_u16(buf, *offset)? as usize;
                *offset += 2;
                let rdata_offset = *offset;
                let rdata = buf.get(*offset..*offset + rdlength).ok_or(WireError::Truncated)?.to_vec();
                *offset += rdlength;
                records.push(ResourceRecord { name, rtype, rclass, ttl, rdata, rdata_offset });
            }
            Ok(records)
        };

        let answers = read_rr_section(ancount, &mut offset)?;
        let authorities = read_rr_section(nscount, &mut offset)?;
        let additionals = read_rr_section(arcount, &mut offset)?;

        Ok(Message {
            id,
            flags,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Truncated,
    BadLabel,
    TooManyCompressionJumps,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => write!(f, "truncated DNS message"),
            WireError::BadLabel => write!(f, "malformed DNS label"),
            WireError::TooManyCompressionJumps => write!(f, "too many DNS name-compression jumps"),
        }
    }
}

impl std::error::Error for WireError {}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, WireError> {
    let bytes = buf.get(offset..offset + 2).ok_or(WireError::Truncated)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, WireError> {
    let bytes = buf.get(offset..offset + 4).ok_or(WireError::Truncated)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_type_class(buf: &[u8], offset: usize) -> Result<(u16, u16), WireError> {
    Ok((read_u16(buf, offset)?, read_u16(buf, offset + 2)?))
}

/// Reads a (possibly compressed) domain name starting at `offset`, returning
/// the decoded dotted name and the offset just past the name *as it appears
/// in the message* (i.e. past the first pointer, not its target).
fn read_name(buf: &[u8], offset: usize) -> Result<(String, usize), WireError> {
    let mut labels = Vec::new();
    let mut cursor = offset;
    let mut end_of_name: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let length = *buf.get(cursor).ok_or(WireError::Truncated)?;
        if length == 0 {
            cursor += 1;
            if end_of_name.is_none() {
                end_of_name = Some(cursor);
            }
            break;
        } else if length & 0xc0 == 0xc0 {
            jumps += 1;
            if jumps > MAX_COMPRESSION_JUMPS {
                return Err(WireError::TooManyCompressionJumps);
            }
            let second_byte = *buf.get(cursor + 1).ok_or(WireError::Truncated)?;
            let pointer = (((length as usize) & 0x3f) << 8) | second_byte as usize;
            if end_of_name.is_none() {
                end_of_name = Some(cursor + 2);
            }
            cursor = pointer;
        } else if length & 0xc0 != 0 {
            return Err(WireError::BadLabel);
        } else {
            let length = length as usize;
            let label = buf.get(cursor + 1..cursor + 1 + length).ok_or(WireError::Truncated)?;
            labels.push(String::from_utf8_lossy(label).into_owned());
            cursor += 1 + length;
        }
    }

    Ok((labels.join("."), end_of_name.unwrap_or(cursor)))
}

/// Writes `name` with no compression (queries always carry a single
/// question, so there is nothing to compress against).
fn write_name(out: &mut Vec<u8>, name: &str) {
    if !name.is_empty() {
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
}

#[cfg(test)]
#[path = "tests/wire_tests.rs"]
mod tests;
