//! Osprey TFTP: a stop-and-wait TFTP (RFC 1350, RFC 2347) client and
//! server.
//!
//! - [`packet`] encodes and decodes the six TFTP packet kinds
//! - [`transport`] moves them over UDP with per-attempt timeouts
//! - [`transfer`] runs the send and receive state machines
//! - [`client::TftpClient`] and [`server::TftpServer`] drive the engine from
//!   either side of a transfer

pub mod audit;
pub mod block;
pub mod buffer_pool;
pub mod client;
pub mod config;
pub mod error;
pub mod netascii;
pub mod packet;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod transfer;
pub mod transport;

pub use buffer_pool::BufferPool;
pub use client::TftpClient;
pub use config::{ClientConfig, LogFormat, LoggingConfig, ServerConfig, ServerMode, SocketConfig};
pub use error::{Result, TftpError};
pub use packet::{ErrorCode, Opcode, Packet, PacketError, TftpOption, TransferMode};
pub use server::{BoundServer, ShutdownHandle, TftpServer};
pub use transfer::{PeerIdentity, TransferStats};
pub use transport::Transport;

/// Well-known TFTP server port
pub const TFTP_PORT: u16 = 69;

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
