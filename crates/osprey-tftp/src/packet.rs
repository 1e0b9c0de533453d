//! TFTP packet codec (RFC 1350, RFC 2347 OACK).
//!
//! Every packet starts with a two byte big-endian opcode, so the first byte
//! on the wire is always zero. Strings are NUL terminated.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum DATA payload. A shorter payload ends the transfer.
pub const SEGMENT_SIZE: usize = 512;
/// Opcode plus block number.
pub const HEADER_SIZE: usize = 4;
pub const MAX_PACKET_SIZE: usize = SEGMENT_SIZE + HEADER_SIZE;
pub const MIN_PACKET_SIZE: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram of {0} bytes is shorter than the 4 byte minimum")]
    TooShort(usize),

    #[error("invalid opcode {0:#06x}")]
    InvalidOpcode(u16),

    #[error("{0} is not NUL terminated")]
    Unterminated(&'static str),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("unknown transfer mode {0:?}")]
    UnknownMode(String),

    #[error("DATA payload of {0} bytes exceeds the 512 byte segment size")]
    PayloadTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, PacketError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,  // Read request (RFC 1350)
    Wrq = 2,  // Write request (RFC 1350)
    Data = 3, // Data packet (RFC 1350)
    Ack = 4,  // Acknowledgment (RFC 1350)
    Error = 5,
    Oack = 6, // Option acknowledgment (RFC 2347)
}

impl TryFrom<u16> for Opcode {
    type Error = PacketError;

    fn try_from(value: u16) -> std::result::Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(PacketError::InvalidOpcode(value)),
        }
    }
}

/// RFC 1350 error codes, plus RFC 2347 option negotiation failure.
///
/// Codes outside the defined range are kept as `Other` so a peer's code is
/// reported to the caller verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTid,
    FileExists,
    NoSuchUser,
    InvalidOptions,
    Other(u16),
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::InvalidOptions => 8,
            ErrorCode::Other(code) => code,
        }
    }

    /// Default human readable text for the code.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::NotDefined | ErrorCode::Other(_) => "Not defined, see error message.",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalOperation => "Illegal TFTP operation.",
            ErrorCode::UnknownTid => "Unknown transfer ID.",
            ErrorCode::FileExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
            ErrorCode::InvalidOptions => "Invalid options.",
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            0 => ErrorCode::NotDefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::InvalidOptions,
            other => ErrorCode::Other(other),
        }
    }
}

/// RFC 1350 transfer modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferMode {
    /// 8-bit ASCII with CR LF line endings on the wire.
    Netascii,
    /// Raw bytes.
    #[default]
    Octet,
    /// Obsolete; recognised on the wire but never served.
    Mail,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
        }
    }
}

impl FromStr for TransferMode {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("netascii") {
            Ok(TransferMode::Netascii)
        } else if s.eq_ignore_ascii_case("octet") {
            Ok(TransferMode::Octet)
        } else if s.eq_ignore_ascii_case("mail") {
            Ok(TransferMode::Mail)
        } else {
            Err(PacketError::UnknownMode(s.to_string()))
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An RFC 2347 option: a name/value pair. Names are case-insensitive and
/// stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TftpOption {
    pub name: String,
    pub value: String,
}

impl TftpOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: TransferMode,
        options: Vec<TftpOption>,
    },
    Wrq {
        filename: String,
        mode: TransferMode,
        options: Vec<TftpOption>,
    },
    Data {
        block: u16,
        payload: Bytes,
    },
    Ack {
        block: u16,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Oack {
        options: Vec<TftpOption>,
    },
}

impl From<ErrorCode> for Packet {
    /// ERROR packet carrying the code's default description.
    fn from(code: ErrorCode) -> Packet {
        Packet::Error {
            code,
            message: code.description().to_string(),
        }
    }
}

impl Packet {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Packet {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack { .. } => Opcode::Oack,
        }
    }

    /// Parses one datagram.
    pub fn decode(datagram: &[u8]) -> Result<Packet> {
        if datagram.len() < MIN_PACKET_SIZE {
            return Err(PacketError::TooShort(datagram.len()));
        }

        let opcode = Opcode::try_from(u16::from_be_bytes([datagram[0], datagram[1]]))?;
        let body = &datagram[2..];

        match opcode {
            Opcode::Rrq => {
                let (filename, mode, options) = decode_request(body)?;
                Ok(Packet::Rrq {
                    filename,
                    mode,
                    options,
                })
            }
            Opcode::Wrq => {
                let (filename, mode, options) = decode_request(body)?;
                Ok(Packet::Wrq {
                    filename,
                    mode,
                    options,
                })
            }
            Opcode::Data => {
                let payload = &body[2..];
                if payload.len() > SEGMENT_SIZE {
                    return Err(PacketError::PayloadTooLarge(payload.len()));
                }
                Ok(Packet::Data {
                    block: u16::from_be_bytes([body[0], body[1]]),
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            Opcode::Ack => Ok(Packet::Ack {
                block: u16::from_be_bytes([body[0], body[1]]),
            }),
            Opcode::Error => {
                let code = ErrorCode::from(u16::from_be_bytes([body[0], body[1]]));
                let text = &body[2..];
                let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
                Ok(Packet::Error {
                    code,
                    message: String::from_utf8_lossy(&text[..end]).into_owned(),
                })
            }
            Opcode::Oack => Ok(Packet::Oack {
                options: decode_options(body),
            }),
        }
    }

    /// Exact encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        let options_len =
            |options: &[TftpOption]| -> usize { options.iter().map(|o| o.name.len() + o.value.len() + 2).sum() };

        2 + match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            }
            | Packet::Wrq {
                filename,
                mode,
                options,
            } => filename.len() + mode.as_str().len() + 2 + options_len(options),
            Packet::Data { payload, .. } => 2 + payload.len(),
            Packet::Ack { .. } => 2,
            Packet::Error { message, .. } => 2 + message.len() + 1,
            Packet::Oack { options } => options_len(options),
        }
    }

    /// Encodes into a freshly allocated buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Encodes into `buf`, replacing its contents. Reusing one buffer across
    /// packets avoids an allocation per send.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.clear();
        buf.reserve(self.encoded_len());
        self.write_to(buf);
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.opcode() as u16);
        match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            }
            | Packet::Wrq {
                filename,
                mode,
                options,
            } => {
                put_string(buf, filename);
                put_string(buf, mode.as_str());
                put_options(buf, options);
            }
            Packet::Data { block, payload } => {
                debug_assert!(payload.len() <= SEGMENT_SIZE);
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => buf.put_u16(*block),
            Packet::Error { code, message } => {
                buf.put_u16(code.as_u16());
                put_string(buf, message);
            }
            Packet::Oack { options } => put_options(buf, options),
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_options(buf: &mut BytesMut, options: &[TftpOption]) {
    for option in options {
        put_string(buf, &option.name);
        put_string(buf, &option.value);
    }
}

/// Splits the next NUL terminated string off `bytes`.
fn take_string<'a>(bytes: &mut &'a [u8], field: &'static str) -> Result<&'a str> {
    let zero = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::Unterminated(field))?;
    let s = std::str::from_utf8(&bytes[..zero]).map_err(|_| PacketError::InvalidUtf8(field))?;
    *bytes = &bytes[zero + 1..];
    Ok(s)
}

fn decode_request(mut body: &[u8]) -> Result<(String, TransferMode, Vec<TftpOption>)> {
    let filename = take_string(&mut body, "filename")?.to_string();
    let mode = take_string(&mut body, "mode")?.parse()?;
    Ok((filename, mode, decode_options(body)))
}

// Malformed or dangling option pairs are dropped rather than failing the
// whole request.
fn decode_options(mut body: &[u8]) -> Vec<TftpOption> {
    let mut options = Vec::new();
    while !body.is_empty() {
        let name = match take_string(&mut body, "option name") {
            Ok(name) => name,
            Err(_) => break,
        };
        let value = match take_string(&mut body, "option value") {
            Ok(value) => value,
            Err(_) => break,
        };
        if !name.is_empty() {
            options.push(TftpOption::new(name, value));
        }
    }
    options
}
