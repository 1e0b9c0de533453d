use thiserror::Error;

use crate::packet::{ErrorCode, PacketError};

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Every retry attempt ran out without a usable reply.
    #[error("Transfer timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Malformed packet: {0}")]
    Packet(#[from] PacketError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The peer aborted the transfer with an ERROR packet.
    #[error("Peer reported error {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// A server policy refused the request; the peer was told with `code`.
    #[error("Request denied ({code:?}): {message}")]
    Denied { code: ErrorCode, message: String },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TftpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TftpError::Timeout { .. })
    }

    /// The ERROR code this failure is reported with when told to a peer.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TftpError::Remote { code, .. } | TftpError::Denied { code, .. } => *code,
            TftpError::Packet(_) | TftpError::Protocol(_) => ErrorCode::IllegalOperation,
            TftpError::Io(e) if e.kind() == std::io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            TftpError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorCode::AccessViolation
            }
            _ => ErrorCode::NotDefined,
        }
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;
