//! TFTP packet codec (RFC 1350 with RFC 2347 option extension)

use crate::error::PxeError;

/// TFTP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
    /// RFC 2347 option negotiation refused
    OptionRefused = 8,
}

impl ErrorCode {
    fn from_u16(code: u16) -> Self {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionRefused,
            _ => ErrorCode::NotDefined,
        }
    }
}

/// Request options as sent by the client, names lowercased
pub type Options = Vec<(String, String)>;

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: String,
        options: Options,
    },
    Wrq {
        filename: String,
        mode: String,
        options: Options,
    },
    Data {
        block: u16,
        data: Vec<u8>,
    },
    Ack(u16),
    Error {
        code: ErrorCode,
        message: String,
    },
    Oack(Options),
}

const RRQ: u16 = 1;
const WRQ: u16 = 2;
const DATA: u16 = 3;
const ACK: u16 = 4;
const ERROR: u16 = 5;
const OACK: u16 = 6;

fn malformed(what: &str) -> PxeError {
    PxeError::Tftp(format!("Malformed packet: {}", what))
}

/// Split a run of NUL-terminated strings
fn strings(bytes: &[u8]) -> Result<Vec<String>, PxeError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if bytes.last() != Some(&0) {
        return Err(malformed("unterminated string"));
    }
    bytes[..bytes.len() - 1]
        .split(|b| *b == 0)
        .map(|s| {
            String::from_utf8(s.to_vec()).map_err(|e| malformed(&format!("string is not UTF-8: {}", e)))
        })
        .collect()
}

fn request(body: &[u8]) -> Result<(String, String, Options), PxeError> {
    let mut fields = strings(body)?.into_iter();
    let filename = fields.next().ok_or_else(|| malformed("missing filename"))?;
    let mode = fields
        .next()
        .ok_or_else(|| malformed("missing mode"))?
        .to_ascii_lowercase();

    let rest: Vec<String> = fields.collect();
    if rest.len() % 2 != 0 {
        return Err(malformed("option without value"));
    }
    let options = rest
        .chunks(2)
        .map(|pair| (pair[0].to_ascii_lowercase(), pair[1].clone()))
        .collect();

    Ok((filename, mode, options))
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

impl Packet {
    pub fn decode(bytes: &[u8]) -> Result<Self, PxeError> {
        if bytes.len() < 2 {
            return Err(malformed("shorter than an opcode"));
        }
        let opcode = u16::from_be_bytes([bytes[0], bytes[1]]);
        let body = &bytes[2..];

        match opcode {
            RRQ => {
                let (filename, mode, options) = request(body)?;
                Ok(Packet::Rrq { filename, mode, options })
            }
            WRQ => {
                let (filename, mode, options) = request(body)?;
                Ok(Packet::Wrq { filename, mode, options })
            }
            DATA | ACK | ERROR if body.len() < 2 => Err(malformed("missing block number")),
            DATA => Ok(Packet::Data {
                block: u16::from_be_bytes([body[0], body[1]]),
                data: body[2..].to_vec(),
            }),
            ACK => Ok(Packet::Ack(u16::from_be_bytes([body[0], body[1]]))),
            ERROR => {
                let code = ErrorCode::from_u16(u16::from_be_bytes([body[0], body[1]]));
                let message = strings(&body[2..])?.into_iter().next().unwrap_or_default();
                Ok(Packet::Error { code, message })
            }
            OACK => {
                let fields = strings(body)?;
                if fields.len() % 2 != 0 {
                    return Err(malformed("option without value"));
                }
                Ok(Packet::Oack(
                    fields
                        .chunks(2)
                        .map(|pair| (pair[0].clone(), pair[1].clone()))
                        .collect(),
                ))
            }
            other => Err(malformed(&format!("unknown opcode {}", other))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Packet::Rrq { filename, mode, options } | Packet::Wrq { filename, mode, options } => {
                let opcode = if matches!(self, Packet::Rrq { .. }) { RRQ } else { WRQ };
                buf.extend_from_slice(&opcode.to_be_bytes());
                push_str(&mut buf, filename);
                push_str(&mut buf, mode);
                for (name, value) in options {
                    push_str(&mut buf, name);
                    push_str(&mut buf, value);
                }
            }
            Packet::Data { block, data } => {
                buf.reserve(4 + data.len());
                buf.extend_from_slice(&DATA.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack(block) => {
                buf.extend_from_slice(&ACK.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&ERROR.to_be_bytes());
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                push_str(&mut buf, message);
            }
            Packet::Oack(options) => {
                buf.extend_from_slice(&OACK.to_be_bytes());
                for (name, value) in options {
                    push_str(&mut buf, name);
                    push_str(&mut buf, value);
                }
            }
        }
        buf
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }
}
