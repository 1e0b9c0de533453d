//! TFTP client.
//!
//! Each call is one complete transfer on a fresh ephemeral socket. A call
//! returns only once the transfer has finished, the retry budget is spent,
//! or the transfer failed.
//!
//! A failed download leaves whatever it already wrote in the sink; the
//! client never truncates or deletes. Callers that need all-or-nothing
//! semantics should download to a temporary file and rename it.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::buffer_pool::BufferPool;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::packet::Packet;
use crate::transfer::{self, PeerIdentity, Role, TransferSettings, TransferStats};
use crate::transport::Transport;

pub struct TftpClient {
    server_addr: SocketAddr,
    config: ClientConfig,
    buffers: BufferPool,
}

impl TftpClient {
    pub fn new(server_addr: SocketAddr, config: ClientConfig) -> Self {
        Self {
            server_addr,
            config,
            buffers: BufferPool::new(2),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn local_addr(&self) -> SocketAddr {
        self.config.local_addr.unwrap_or_else(|| {
            if self.server_addr.is_ipv6() {
                SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
            } else {
                SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
            }
        })
    }

    async fn transport(&self) -> Result<Transport> {
        let mut transport = Transport::bind(self.local_addr(), self.config.timeout).await?;
        transport.begin_buffered_ops(&self.buffers);
        Ok(transport)
    }

    fn settings(&self) -> TransferSettings {
        TransferSettings::new(Role::Client, self.config.mode, self.config.max_retries)
    }

    /// Downloads `remote` into `sink`.
    pub async fn receive_file<W>(&self, remote: &str, sink: W) -> Result<TransferStats>
    where
        W: AsyncWrite + Unpin,
    {
        let rrq = Packet::Rrq {
            filename: remote.to_string(),
            mode: self.config.mode,
            options: self.config.options.clone(),
        };

        let mut transport = self.transport().await?;
        let stats = transfer::receive(
            &mut transport,
            PeerIdentity::Pending(self.server_addr),
            rrq,
            sink,
            &self.settings(),
        )
        .await?;

        info!(
            "Received {} ({} bytes in {} blocks) from {}",
            remote, stats.bytes, stats.blocks, self.server_addr
        );
        Ok(stats)
    }

    /// Uploads everything `source` yields as `remote`.
    pub async fn send_file<R>(&self, remote: &str, source: R) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin,
    {
        let wrq = Packet::Wrq {
            filename: remote.to_string(),
            mode: self.config.mode,
            options: self.config.options.clone(),
        };

        let mut transport = self.transport().await?;
        let stats = transfer::send(
            &mut transport,
            PeerIdentity::Pending(self.server_addr),
            Some(wrq),
            source,
            &self.settings(),
        )
        .await?;

        info!(
            "Sent {} ({} bytes in {} blocks) to {}",
            remote, stats.bytes, stats.blocks, self.server_addr
        );
        Ok(stats)
    }

    /// Downloads `remote` to a local file, creating or truncating it.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<TransferStats> {
        let file = File::create(local).await?;
        self.receive_file(remote, file).await
    }

    /// Uploads a local file as `remote`.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<TransferStats> {
        let file = File::open(local).await?;
        self.send_file(remote, file).await
    }
}
