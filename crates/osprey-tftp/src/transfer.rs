//! Stop-and-wait transfer engine.
//!
//! One engine serves both roles. A client download and a server handling a
//! write request both run a [`ReceiveSession`]; a client upload and a server
//! handling a read request both run a [`SendSession`]. The roles differ only
//! in the kickoff packet, whether the peer is known up front, and whether an
//! OACK is acceptable.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::block;
use crate::error::{Result, TftpError};
use crate::netascii::{NetasciiDecoder, NetasciiEncoder};
use crate::packet::{ErrorCode, Packet, SEGMENT_SIZE, TftpOption, TransferMode};
use crate::transport::Transport;

/// Which side of the exchange this engine is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub mode: TransferMode,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_retries: u32,
    pub role: Role,
    /// Largest number of bytes a download may write to its sink.
    pub max_bytes: Option<u64>,
}

impl TransferSettings {
    pub fn new(role: Role, mode: TransferMode, max_retries: u32) -> Self {
        Self {
            mode,
            max_retries,
            role,
            max_bytes: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

/// Totals for a finished transfer. `bytes` counts payload bytes on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes: u64,
    pub blocks: u64,
    pub retransmissions: u64,
}

/// The remote transfer ID.
///
/// A client only knows the server's well-known address when it starts; the
/// port the server actually answers from becomes the peer on the first reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerIdentity {
    Pending(SocketAddr),
    Established(SocketAddr),
}

impl PeerIdentity {
    pub fn addr(self) -> SocketAddr {
        match self {
            PeerIdentity::Pending(addr) | PeerIdentity::Established(addr) => addr,
        }
    }

    /// Whether a datagram from `from` may fix a pending identity.
    fn may_establish(expected: SocketAddr, from: SocketAddr) -> bool {
        let expected_ip = expected.ip().to_canonical();
        expected_ip.is_unspecified() || expected_ip == from.ip().to_canonical()
    }
}

/// Checks an OACK against the options the request carried and what this
/// engine can honour. A server may only acknowledge options it was asked
/// for. Only the default block size is supported; `tsize` and `timeout`
/// are informational.
pub fn check_oack(
    options: &[TftpOption],
    requested: &[TftpOption],
) -> std::result::Result<(), String> {
    for option in options {
        if !requested.iter().any(|r| r.name == option.name) {
            return Err(format!("Option {} was not requested", option.name));
        }
        match option.name.as_str() {
            "blksize" => {
                if option.value.trim().parse::<usize>() != Ok(SEGMENT_SIZE) {
                    return Err(format!("Unsupported blksize {}", option.value));
                }
            }
            "tsize" | "timeout" => {}
            other => return Err(format!("Unsupported option {}", other)),
        }
    }
    Ok(())
}

/// Options carried by a read or write request.
fn requested_options(packet: Option<&Packet>) -> Vec<TftpOption> {
    match packet {
        Some(Packet::Rrq { options, .. } | Packet::Wrq { options, .. }) => options.clone(),
        _ => Vec::new(),
    }
}

/// Peer tracking, retry accounting and retransmission shared by both
/// directions.
struct Exchange<'t> {
    transport: &'t mut Transport,
    peer: PeerIdentity,
    max_retries: u32,
    retries: u32,
    last_sent: Option<Packet>,
    stats: TransferStats,
}

impl<'t> Exchange<'t> {
    fn new(transport: &'t mut Transport, peer: PeerIdentity, max_retries: u32) -> Self {
        Self {
            transport,
            peer,
            max_retries: max_retries.max(1),
            retries: 0,
            last_sent: None,
            stats: TransferStats::default(),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.transport.timeout()
    }

    async fn transmit(&mut self, packet: Packet) -> Result<()> {
        debug!("-> {} {:?}", self.peer.addr(), summary(&packet));
        self.transport.send(&packet, self.peer.addr()).await?;
        self.last_sent = Some(packet);
        Ok(())
    }

    async fn retransmit(&mut self) -> Result<()> {
        if let Some(packet) = &self.last_sent {
            self.transport.send(packet, self.peer.addr()).await?;
            self.stats.retransmissions += 1;
        }
        Ok(())
    }

    /// Best-effort ERROR; the session is already ending or the recipient is
    /// not our peer.
    async fn notify(&mut self, to: SocketAddr, packet: Packet) {
        if let Err(e) = self.transport.send(&packet, to).await {
            debug!("Failed to send error to {}: {}", to, e);
        }
    }

    async fn notify_peer(&mut self, code: ErrorCode, message: impl Into<String>) {
        let to = self.peer.addr();
        self.notify(to, Packet::error(code, message)).await;
    }

    /// The next packet from the peer, or `None` once `deadline` passes.
    ///
    /// Datagrams from other transfer IDs are answered with `UnknownTid` and
    /// skipped without extending the deadline.
    async fn next_packet(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        loop {
            let (decoded, from) = match self.transport.receive_until(deadline).await {
                Ok(datagram) => datagram,
                Err(e) if e.is_timeout() => return Ok(None),
                Err(e) => return Err(e),
            };

            match self.peer {
                PeerIdentity::Established(addr) if addr == from => {}
                PeerIdentity::Pending(addr) if PeerIdentity::may_establish(addr, from) => {
                    debug!("Transfer ID established with {}", from);
                    self.peer = PeerIdentity::Established(from);
                }
                _ => {
                    warn!("Datagram from unknown transfer ID {}", from);
                    self.notify(from, Packet::error(ErrorCode::UnknownTid, "Unknown transfer ID"))
                        .await;
                    continue;
                }
            }

            return match decoded {
                Ok(packet) => {
                    debug!("<- {} {:?}", from, summary(&packet));
                    Ok(Some(packet))
                }
                Err(e) => {
                    self.notify_peer(ErrorCode::IllegalOperation, e.to_string())
                        .await;
                    Err(e.into())
                }
            };
        }
    }

    /// Counts a failed attempt and retransmits, or fails once the budget is
    /// spent.
    async fn retry(&mut self, reason: &str) -> Result<()> {
        self.retries += 1;
        if self.retries >= self.max_retries {
            warn!(
                "Giving up on {} after {} attempts ({})",
                self.peer.addr(),
                self.retries,
                reason
            );
            return Err(TftpError::Timeout {
                attempts: self.retries,
            });
        }
        debug!(
            "Retry {}/{} to {}: {}",
            self.retries,
            self.max_retries,
            self.peer.addr(),
            reason
        );
        self.retransmit().await
    }

    fn progressed(&mut self) {
        self.retries = 0;
    }

    async fn unexpected<T>(&mut self, packet: &Packet) -> Result<T> {
        let message = format!("Unexpected {:?} packet", packet.opcode());
        self.notify_peer(ErrorCode::IllegalOperation, message.clone())
            .await;
        Err(TftpError::Protocol(message))
    }

    async fn reject_oack<T>(&mut self, reason: String) -> Result<T> {
        self.notify_peer(ErrorCode::InvalidOptions, reason.clone())
            .await;
        Err(TftpError::Protocol(reason))
    }
}

/// Short packet description for logs; payloads are summarised by length.
fn summary(packet: &Packet) -> String {
    match packet {
        Packet::Data { block, payload } => format!("DATA {} ({} bytes)", block, payload.len()),
        Packet::Ack { block } => format!("ACK {}", block),
        Packet::Error { code, message } => format!("ERROR {} {}", code.as_u16(), message),
        Packet::Rrq { filename, mode, .. } => format!("RRQ {} {}", filename, mode),
        Packet::Wrq { filename, mode, .. } => format!("WRQ {} {}", filename, mode),
        Packet::Oack { options } => format!("OACK {} options", options.len()),
    }
}

fn converts_text(mode: TransferMode) -> bool {
    matches!(mode, TransferMode::Netascii | TransferMode::Mail)
}

/// Download-side sink: converts line endings and enforces the size limit.
struct BlockSink<W> {
    inner: W,
    decoder: Option<NetasciiDecoder>,
    scratch: Vec<u8>,
    written: u64,
    limit: Option<u64>,
}

impl<W: AsyncWrite + Unpin> BlockSink<W> {
    fn new(inner: W, mode: TransferMode, limit: Option<u64>) -> Self {
        Self {
            inner,
            decoder: converts_text(mode).then(NetasciiDecoder::new),
            scratch: Vec::with_capacity(SEGMENT_SIZE),
            written: 0,
            limit,
        }
    }

    /// Writes one block. The final block is flushed before returning so the
    /// data is durable before it is acknowledged.
    async fn write_block(&mut self, payload: &[u8], last: bool) -> io::Result<()> {
        self.scratch.clear();
        match self.decoder.as_mut() {
            Some(decoder) => {
                decoder.decode(payload, &mut self.scratch);
                if last {
                    decoder.finish(&mut self.scratch);
                }
            }
            None => self.scratch.extend_from_slice(payload),
        }

        let len = self.scratch.len() as u64;
        if let Some(limit) = self.limit {
            if self.written + len > limit {
                return Err(io::Error::new(io::ErrorKind::StorageFull, "File too large"));
            }
        }

        self.inner.write_all(&self.scratch).await?;
        self.written += len;
        if last {
            self.inner.flush().await?;
        }
        Ok(())
    }
}

/// Upload-side source: cuts the input into segments, converting line
/// endings first when the mode asks for it.
struct BlockSource<R> {
    inner: R,
    encoder: Option<NetasciiEncoder>,
    pending: Vec<u8>,
    raw: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> BlockSource<R> {
    fn new(inner: R, mode: TransferMode) -> Self {
        Self {
            inner,
            encoder: converts_text(mode).then(NetasciiEncoder::new),
            pending: Vec::with_capacity(SEGMENT_SIZE * 2),
            raw: vec![0u8; SEGMENT_SIZE],
            eof: false,
        }
    }

    /// The next payload. Short reads are retried so only the final block is
    /// ever shorter than a segment; an exhausted source yields an empty
    /// payload.
    async fn next_block(&mut self) -> io::Result<Bytes> {
        while self.pending.len() < SEGMENT_SIZE && !self.eof {
            let n = self.inner.read(&mut self.raw).await?;
            let chunk = &self.raw[..n];
            match self.encoder.as_mut() {
                Some(encoder) if n == 0 => encoder.finish(&mut self.pending),
                Some(encoder) => encoder.encode(chunk, &mut self.pending),
                None => self.pending.extend_from_slice(chunk),
            }
            self.eof = n == 0;
        }

        let take = self.pending.len().min(SEGMENT_SIZE);
        let payload = Bytes::copy_from_slice(&self.pending[..take]);
        self.pending.drain(..take);
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// Request (or ACK 0) sent; nothing heard from the peer yet.
    AwaitingFirstReply,
    Receiving,
    Complete,
    Failed,
}

/// Receiving half of a transfer: accepts DATA blocks in order and
/// acknowledges each one.
pub struct ReceiveSession<'t, W> {
    exchange: Exchange<'t>,
    sink: BlockSink<W>,
    role: Role,
    state: ReceiveState,
    kickoff: Option<Packet>,
    requested: Vec<TftpOption>,
    expected: u16,
}

impl<'t, W: AsyncWrite + Unpin> ReceiveSession<'t, W> {
    /// `kickoff` is the RRQ for a client or ACK 0 for a server.
    pub fn new(
        transport: &'t mut Transport,
        peer: PeerIdentity,
        kickoff: Packet,
        sink: W,
        settings: &TransferSettings,
    ) -> Self {
        Self {
            exchange: Exchange::new(transport, peer, settings.max_retries),
            sink: BlockSink::new(sink, settings.mode, settings.max_bytes),
            role: settings.role,
            state: ReceiveState::AwaitingFirstReply,
            requested: requested_options(Some(&kickoff)),
            kickoff: Some(kickoff),
            expected: 1,
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    pub fn peer(&self) -> PeerIdentity {
        self.exchange.peer
    }

    pub fn stats(&self) -> TransferStats {
        self.exchange.stats
    }

    pub async fn run(&mut self) -> Result<TransferStats> {
        match self.drive().await {
            Ok(()) => {
                if self.role == Role::Server {
                    self.dally().await;
                }
                Ok(self.exchange.stats)
            }
            Err(e) => {
                self.state = ReceiveState::Failed;
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        if let Some(kickoff) = self.kickoff.take() {
            self.exchange.transmit(kickoff).await?;
        }
        loop {
            match self.state {
                ReceiveState::AwaitingFirstReply | ReceiveState::Receiving => {
                    self.await_block().await?
                }
                ReceiveState::Complete => return Ok(()),
                ReceiveState::Failed => {
                    return Err(TftpError::Protocol("Transfer already failed".to_string()));
                }
            }
        }
    }

    /// Waits one attempt for the expected block.
    async fn await_block(&mut self) -> Result<()> {
        let deadline = self.exchange.deadline();
        loop {
            let Some(packet) = self.exchange.next_packet(deadline).await? else {
                return self.exchange.retry("timed out waiting for data").await;
            };

            match packet {
                Packet::Data { block, payload } if block == self.expected => {
                    return self.accept_block(block, payload).await;
                }
                Packet::Data { block, .. } => self.out_of_sequence(block).await?,
                Packet::Oack { options }
                    if self.role == Role::Client
                        && self.state == ReceiveState::AwaitingFirstReply =>
                {
                    return self.accept_oack(&options).await;
                }
                Packet::Error { code, message } => {
                    return Err(TftpError::Remote { code, message });
                }
                other => return self.exchange.unexpected(&other).await,
            }
        }
    }

    async fn accept_block(&mut self, block: u16, payload: Bytes) -> Result<()> {
        let last = payload.len() < SEGMENT_SIZE;
        if let Err(e) = self.sink.write_block(&payload, last).await {
            self.exchange
                .notify_peer(ErrorCode::DiskFull, e.to_string())
                .await;
            return Err(e.into());
        }

        self.exchange.stats.bytes += payload.len() as u64;
        self.exchange.stats.blocks += 1;
        self.exchange.progressed();
        self.expected = block::next(block);
        self.exchange.transmit(Packet::Ack { block }).await?;
        self.state = if last {
            ReceiveState::Complete
        } else {
            ReceiveState::Receiving
        };
        Ok(())
    }

    async fn out_of_sequence(&mut self, block: u16) -> Result<()> {
        self.exchange.transport.discard_packets().await?;
        if block == block::previous(self.expected) {
            debug!("Duplicate DATA {}, re-acknowledging", block);
            self.exchange.retransmit().await?;
        } else {
            debug!("Ignoring DATA {} while expecting {}", block, self.expected);
        }
        Ok(())
    }

    async fn accept_oack(&mut self, options: &[TftpOption]) -> Result<()> {
        if let Err(reason) = check_oack(options, &self.requested) {
            return self.exchange.reject_oack(reason).await;
        }
        self.exchange.progressed();
        self.exchange.transmit(Packet::Ack { block: 0 }).await?;
        self.state = ReceiveState::Receiving;
        Ok(())
    }

    /// Holds the final ACK for one timeout window in case the peer missed it.
    async fn dally(&mut self) {
        let deadline = self.exchange.deadline();
        let last = block::previous(self.expected);
        loop {
            match self.exchange.next_packet(deadline).await {
                Ok(Some(Packet::Data { block, .. })) if block == last => {
                    if self.exchange.retransmit().await.is_err() {
                        return;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// WRQ sent; waiting for ACK 0 or an OACK.
    AwaitingRequestAck,
    Sending,
    Complete,
    Failed,
}

/// Sending half of a transfer: one DATA block in flight at a time.
pub struct SendSession<'t, R> {
    exchange: Exchange<'t>,
    source: BlockSource<R>,
    role: Role,
    state: SendState,
    request: Option<Packet>,
    requested: Vec<TftpOption>,
    block: u16,
    last_len: usize,
}

impl<'t, R: AsyncRead + Unpin> SendSession<'t, R> {
    /// `request` is the client's WRQ; a server passes `None` and starts
    /// with DATA 1.
    pub fn new(
        transport: &'t mut Transport,
        peer: PeerIdentity,
        request: Option<Packet>,
        source: R,
        settings: &TransferSettings,
    ) -> Self {
        let state = if request.is_some() {
            SendState::AwaitingRequestAck
        } else {
            SendState::Sending
        };
        Self {
            exchange: Exchange::new(transport, peer, settings.max_retries),
            source: BlockSource::new(source, settings.mode),
            role: settings.role,
            state,
            requested: requested_options(request.as_ref()),
            request,
            block: 0,
            last_len: 0,
        }
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn peer(&self) -> PeerIdentity {
        self.exchange.peer
    }

    pub fn stats(&self) -> TransferStats {
        self.exchange.stats
    }

    pub async fn run(&mut self) -> Result<TransferStats> {
        match self.drive().await {
            Ok(()) => Ok(self.exchange.stats),
            Err(e) => {
                self.state = SendState::Failed;
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        match self.request.take() {
            Some(request) => self.exchange.transmit(request).await?,
            None => self.send_next_block().await?,
        }
        loop {
            match self.state {
                SendState::AwaitingRequestAck => self.await_request_ack().await?,
                SendState::Sending => self.await_ack().await?,
                SendState::Complete => return Ok(()),
                SendState::Failed => {
                    return Err(TftpError::Protocol("Transfer already failed".to_string()));
                }
            }
        }
    }

    async fn await_request_ack(&mut self) -> Result<()> {
        let deadline = self.exchange.deadline();
        loop {
            let Some(packet) = self.exchange.next_packet(deadline).await? else {
                return self.exchange.retry("timed out waiting for request ack").await;
            };

            match packet {
                Packet::Ack { block: 0 } => break,
                Packet::Ack { block } => {
                    debug!("Ignoring ACK {} before the request was accepted", block);
                }
                Packet::Oack { options } if self.role == Role::Client => {
                    if let Err(reason) = check_oack(&options, &self.requested) {
                        return self.exchange.reject_oack(reason).await;
                    }
                    break;
                }
                Packet::Error { code, message } => {
                    return Err(TftpError::Remote { code, message });
                }
                other => return self.exchange.unexpected(&other).await,
            }
        }

        self.exchange.progressed();
        self.state = SendState::Sending;
        self.send_next_block().await
    }

    async fn await_ack(&mut self) -> Result<()> {
        let deadline = self.exchange.deadline();
        loop {
            let Some(packet) = self.exchange.next_packet(deadline).await? else {
                return self.exchange.retry("timed out waiting for ack").await;
            };

            match packet {
                Packet::Ack { block } if block == self.block => {
                    self.exchange.stats.bytes += self.last_len as u64;
                    self.exchange.stats.blocks += 1;
                    self.exchange.progressed();
                    if self.last_len < SEGMENT_SIZE {
                        self.state = SendState::Complete;
                        return Ok(());
                    }
                    return self.send_next_block().await;
                }
                Packet::Ack { block } => {
                    debug!("ACK {} while DATA {} is outstanding", block, self.block);
                    self.exchange.transport.discard_packets().await?;
                    return self.exchange.retry("out of sequence ack").await;
                }
                Packet::Error { code, message } => {
                    return Err(TftpError::Remote { code, message });
                }
                other => return self.exchange.unexpected(&other).await,
            }
        }
    }

    async fn send_next_block(&mut self) -> Result<()> {
        let payload = match self.source.next_block().await {
            Ok(payload) => payload,
            Err(e) => {
                self.exchange
                    .notify_peer(ErrorCode::NotDefined, e.to_string())
                    .await;
                return Err(e.into());
            }
        };

        self.block = block::next(self.block);
        self.last_len = payload.len();
        self.exchange
            .transmit(Packet::Data {
                block: self.block,
                payload,
            })
            .await
    }
}

/// Runs a download into `sink` and returns its totals.
pub async fn receive<W: AsyncWrite + Unpin>(
    transport: &mut Transport,
    peer: PeerIdentity,
    kickoff: Packet,
    sink: W,
    settings: &TransferSettings,
) -> Result<TransferStats> {
    ReceiveSession::new(transport, peer, kickoff, sink, settings)
        .run()
        .await
}

/// Runs an upload from `source` and returns its totals.
pub async fn send<R: AsyncRead + Unpin>(
    transport: &mut Transport,
    peer: PeerIdentity,
    request: Option<Packet>,
    source: R,
    settings: &TransferSettings,
) -> Result<TransferStats> {
    SendSession::new(transport, peer, request, source, settings)
        .run()
        .await
}
