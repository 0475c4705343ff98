//! Wire codec for the six TFTP packet types.
//!
//! RFC 1350 packet layouts, plus the OACK packet and the option segment from
//! RFC 2347. All multi-byte integers are big-endian; filenames, modes, option
//! names and option values are null-terminated ASCII strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};
use crate::{MAX_PACKET_SIZE, Opcode};

// RFC 1350 strings (filenames, modes, options) are kept short to bound the
// work done on a hostile datagram.
const MAX_STRING_LENGTH: usize = 255;

/// A decoded TFTP packet.
///
/// ```text
/// RRQ/WRQ : opcode(2) | filename\0 | mode\0 | [opt\0 val\0]*
/// DATA    : opcode(2) | block(2)  | payload(0..blksize)
/// ACK     : opcode(2) | block(2)
/// ERROR   : opcode(2) | code(2)   | message\0
/// OACK    : opcode(2) | [opt\0 val\0]*
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest {
        filename: String,
        mode: String,
        options: Vec<(String, String)>,
    },
    WriteRequest {
        filename: String,
        mode: String,
        options: Vec<(String, String)>,
    },
    Data {
        block: u16,
        payload: Bytes,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
    Oack {
        options: Vec<(String, String)>,
    },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::ReadRequest { .. } => Opcode::Rrq,
            Packet::WriteRequest { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack { .. } => Opcode::Oack,
        }
    }

    /// Short packet name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::ReadRequest { .. } => "RRQ",
            Packet::WriteRequest { .. } => "WRQ",
            Packet::Data { .. } => "DATA",
            Packet::Ack { .. } => "ACK",
            Packet::Error { .. } => "ERROR",
            Packet::Oack { .. } => "OACK",
        }
    }

    /// Encode to wire form. Fails when the result would not fit in one
    /// datagram, which callers treat as an invariant violation rather than a
    /// retryable condition.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(self.opcode() as u16);
        match self {
            Packet::ReadRequest {
                filename,
                mode,
                options,
            }
            | Packet::WriteRequest {
                filename,
                mode,
                options,
            } => {
                put_cstr(&mut buf, filename);
                put_cstr(&mut buf, mode);
                for (name, value) in options {
                    put_cstr(&mut buf, name);
                    put_cstr(&mut buf, value);
                }
            }
            Packet::Data { block, payload } => {
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => {
                buf.put_u16(*block);
            }
            Packet::Error { code, message } => {
                buf.put_u16(*code);
                put_cstr(&mut buf, message);
            }
            Packet::Oack { options } => {
                for (name, value) in options {
                    put_cstr(&mut buf, name);
                    put_cstr(&mut buf, value);
                }
            }
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(TftpError::Protocol(format!(
                "encoded packet of {} bytes exceeds the {} byte datagram limit",
                buf.len(),
                MAX_PACKET_SIZE
            )));
        }
        Ok(buf.freeze())
    }

    /// Decode one datagram.
    pub fn decode(mut bytes: &[u8]) -> Result<Packet> {
        if bytes.len() < 2 {
            return Err(TftpError::Protocol("packet too small".to_string()));
        }
        let raw_opcode = bytes.get_u16();
        let opcode = Opcode::from_u16(raw_opcode)
            .ok_or_else(|| TftpError::Protocol(format!("invalid opcode: {raw_opcode}")))?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let filename = take_cstr(&mut bytes)?;
                let mode = take_cstr(&mut bytes)?;
                let options = take_option_pairs(&mut bytes);
                if opcode == Opcode::Rrq {
                    Ok(Packet::ReadRequest {
                        filename,
                        mode,
                        options,
                    })
                } else {
                    Ok(Packet::WriteRequest {
                        filename,
                        mode,
                        options,
                    })
                }
            }
            Opcode::Data => {
                if bytes.len() < 2 {
                    return Err(TftpError::Protocol("DATA packet too small".to_string()));
                }
                let block = bytes.get_u16();
                Ok(Packet::Data {
                    block,
                    payload: Bytes::copy_from_slice(bytes),
                })
            }
            Opcode::Ack => {
                if bytes.len() < 2 {
                    return Err(TftpError::Protocol("ACK packet too small".to_string()));
                }
                Ok(Packet::Ack {
                    block: bytes.get_u16(),
                })
            }
            Opcode::Error => {
                if bytes.len() < 2 {
                    return Err(TftpError::Protocol("ERROR packet too small".to_string()));
                }
                let code = bytes.get_u16();
                // Tolerate a missing terminator on the message; some stacks
                // truncate the trailing null.
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                let message = String::from_utf8_lossy(&bytes[..end]).into_owned();
                Ok(Packet::Error { code, message })
            }
            Opcode::Oack => Ok(Packet::Oack {
                options: take_option_pairs(&mut bytes),
            }),
        }
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Parse a null-terminated string, advancing past the terminator.
fn take_cstr(bytes: &mut &[u8]) -> Result<String> {
    let null_pos = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::Protocol("missing null terminator".to_string()))?;
    if null_pos > MAX_STRING_LENGTH {
        return Err(TftpError::Protocol(
            "string exceeds 255 bytes".to_string(),
        ));
    }
    let s = String::from_utf8(bytes[..null_pos].to_vec())
        .map_err(|e| TftpError::Protocol(format!("invalid string encoding: {e}")))?;
    *bytes = &bytes[null_pos + 1..];
    Ok(s)
}

/// Parse the trailing option segment of an RRQ/WRQ/OACK.
///
/// RFC 2347: a sequence of (name, value) null-terminated pairs. Parsing is
/// tolerant; a trailing name with no paired value ends the segment without
/// error, and unknown names are preserved for the caller to ignore.
fn take_option_pairs(bytes: &mut &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    while !bytes.is_empty() {
        let name = match take_cstr(bytes) {
            Ok(s) => s,
            Err(_) => break,
        };
        let value = match take_cstr(bytes) {
            Ok(s) => s,
            Err(_) => break,
        };
        pairs.push((name, value));
    }
    pairs
}
