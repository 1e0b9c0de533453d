//! UDP datagram transport.
//!
//! Wraps one socket with a per-attempt receive timeout. A timeout surfaces as
//! [`TftpError::Timeout`], distinct from [`TftpError::Io`], which is what the
//! transfer engine's retry loop keys on.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer_pool::{BufferPool, PooledBuffers, RECV_BUFFER_SIZE};
use crate::config::SocketConfig;
use crate::error::{Result, TftpError};
use crate::packet::{Packet, PacketError};

/// Quiet period that ends a drain.
pub const DISCARD_WINDOW: Duration = Duration::from_millis(25);

// Upper bound on datagrams dropped by one drain, so a flooding peer cannot
// hold a session in discard_packets forever.
const MAX_DISCARD: usize = 256;

/// A datagram that arrived, decoded or not, with its sender.
pub type Datagram = (std::result::Result<Packet, PacketError>, SocketAddr);

pub struct Transport {
    socket: UdpSocket,
    timeout: Duration,
    cancel: Option<CancellationToken>,
    buffers: Option<PooledBuffers>,
}

impl Transport {
    pub async fn bind(local: SocketAddr, timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::from_socket(socket, timeout))
    }

    pub fn from_socket(socket: UdpSocket, timeout: Duration) -> Self {
        Self {
            socket,
            timeout,
            cancel: None,
            buffers: None,
        }
    }

    /// Makes every receive return [`TftpError::Cancelled`] as soon as `token`
    /// fires instead of waiting out its timeout.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Borrows a send and a receive buffer from `pool`; every later send and
    /// receive reuses them until [`end_buffered_ops`](Self::end_buffered_ops).
    pub fn begin_buffered_ops(&mut self, pool: &BufferPool) {
        if self.buffers.is_none() {
            self.buffers = Some(pool.acquire());
        }
    }

    /// Returns the buffers to their pool. Dropping the transport does the same.
    pub fn end_buffered_ops(&mut self) {
        self.buffers = None;
    }

    pub fn is_buffered(&self) -> bool {
        self.buffers.is_some()
    }

    /// Encodes and transmits `packet`. Delivery is not confirmed here.
    pub async fn send(&mut self, packet: &Packet, to: SocketAddr) -> Result<()> {
        match self.buffers.as_mut() {
            Some(buffers) => {
                packet.encode_into(&mut buffers.send);
                self.socket.send_to(&buffers.send, to).await?;
            }
            None => {
                let bytes = packet.encode();
                self.socket.send_to(&bytes, to).await?;
            }
        }
        trace!("sent {:?} to {}", packet.opcode(), to);
        Ok(())
    }

    /// Waits up to the configured timeout for one packet.
    pub async fn receive(&mut self) -> Result<(Packet, SocketAddr)> {
        let deadline = Instant::now() + self.timeout;
        let (packet, from) = self.receive_until(deadline).await?;
        Ok((packet?, from))
    }

    /// Waits until `deadline` for one datagram. Decoding failures are handed
    /// back with the sender so the caller can decide whose problem they are.
    pub async fn receive_until(&mut self, deadline: Instant) -> Result<Datagram> {
        let mut scratch;
        let buf: &mut [u8] = match self.buffers.as_mut() {
            Some(buffers) => &mut buffers.recv,
            None => {
                scratch = vec![0u8; RECV_BUFFER_SIZE];
                &mut scratch
            }
        };

        let recv = tokio::time::timeout_at(deadline, self.socket.recv_from(buf));
        let outcome = match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TftpError::Cancelled),
                outcome = recv => outcome,
            },
            None => recv.await,
        };
        let (len, from) = outcome.map_err(|_| TftpError::Timeout { attempts: 1 })??;

        let packet = Packet::decode(&buf[..len]);
        trace!("received {} bytes from {}", len, from);
        Ok((packet, from))
    }

    /// Drops every datagram already queued or arriving within
    /// [`DISCARD_WINDOW`] of the previous one. Returns how many were dropped.
    pub async fn discard_packets(&mut self) -> Result<usize> {
        let mut scratch = [0u8; RECV_BUFFER_SIZE];
        let mut discarded = 0;

        while discarded < MAX_DISCARD {
            match tokio::time::timeout(DISCARD_WINDOW, self.socket.recv_from(&mut scratch)).await {
                Ok(Ok(_)) => discarded += 1,
                // ICMP port unreachable from an earlier send; nothing queued
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        if discarded > 0 {
            debug!("Discarded {} queued datagrams", discarded);
        }
        Ok(discarded)
    }
}

/// Binds a UDP socket with the configured socket options.
pub fn bind_udp(addr: SocketAddr, config: &SocketConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if config.reuse_address {
        socket.set_reuse_address(true)?;
    }
    if config.recv_buffer_kb > 0 {
        socket.set_recv_buffer_size(config.recv_buffer_kb * 1024)?;
    }
    if config.send_buffer_kb > 0 {
        socket.set_send_buffer_size(config.send_buffer_kb * 1024)?;
    }
    if addr.is_ipv6() {
        // Serve IPv4 clients on an unspecified IPv6 bind too; not every
        // platform allows turning this off, which is fine.
        let _ = socket.set_only_v6(false);
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ErrorCode;

    const SHORT: Duration = Duration::from_millis(100);

    async fn pair() -> (Transport, UdpSocket) {
        let transport = Transport::bind("127.0.0.1:0".parse().unwrap(), SHORT)
            .await
            .unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (transport, peer)
    }

    #[tokio::test]
    async fn receive_times_out_with_timeout_error() {
        let (mut transport, _peer) = pair().await;
        let err = transport.receive().await.unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn receive_decodes_and_reports_sender() {
        let (mut transport, peer) = pair().await;
        let to = transport.local_addr().unwrap();
        peer.send_to(&Packet::Ack { block: 9 }.encode(), to).await.unwrap();

        let (packet, from) = transport.receive().await.unwrap();
        assert_eq!(packet, Packet::Ack { block: 9 });
        assert_eq!(from, peer.local_addr().unwrap());
    }

    #[tokio::test]
    async fn malformed_datagram_is_a_packet_error() {
        let (mut transport, peer) = pair().await;
        peer.send_to(&[0, 9, 0, 0], transport.local_addr().unwrap())
            .await
            .unwrap();
        assert!(matches!(
            transport.receive().await,
            Err(TftpError::Packet(PacketError::InvalidOpcode(9)))
        ));
    }

    #[tokio::test]
    async fn discard_drains_queued_datagrams() {
        let (mut transport, peer) = pair().await;
        let to = transport.local_addr().unwrap();
        for block in 0..3u16 {
            peer.send_to(&Packet::Ack { block }.encode(), to).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(transport.discard_packets().await.unwrap(), 3);
        assert!(transport.receive().await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_pending_receive() {
        let token = CancellationToken::new();
        let mut transport = Transport::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(30))
            .await
            .unwrap()
            .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        assert!(matches!(transport.receive().await, Err(TftpError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn buffered_mode_sends_identical_bytes() {
        let pool = BufferPool::new(2);
        let (mut transport, peer) = pair().await;
        transport.begin_buffered_ops(&pool);
        assert!(transport.is_buffered());

        let packet = Packet::error(ErrorCode::DiskFull, "full");
        transport
            .send(&packet, peer.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &packet.encode()[..]);

        transport.end_buffered_ops();
        assert!(!transport.is_buffered());
    }
}
