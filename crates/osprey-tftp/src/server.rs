//! TFTP server dispatch loop.
//!
//! The listening socket only ever sees requests. Each accepted request gets
//! its own task and its own ephemeral socket, so the port it answers from is
//! the transfer ID for that client, and nothing a session does can stall the
//! accept loop or another session.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::net::UdpSocket;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::buffer_pool::{BufferPool, RECV_BUFFER_SIZE};
use crate::config::{ServerConfig, ServerMode};
use crate::error::{Result, TftpError};
use crate::packet::{ErrorCode, Packet, TransferMode};
use crate::sandbox::{self, WriteTarget};
use crate::session::{Direction, SessionGuard, SessionHandle, SessionId, SessionRegistry};
use crate::transfer::{self, PeerIdentity, Role, TransferSettings, TransferStats};
use crate::transport::{Transport, bind_udp};

pub struct TftpServer {
    config: ServerConfig,
}

impl TftpServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listening socket without serving yet.
    pub async fn bind(self) -> Result<BoundServer> {
        let socket = bind_udp(self.config.bind_addr, &self.config.socket)?;
        let local_addr = socket.local_addr()?;
        info!("TFTP server listening on {}", local_addr);

        let context = ServerContext {
            audit: AuditLogger::new(self.config.logging.audit_enabled),
            buffers: BufferPool::new(self.config.buffer_pool_size),
            registry: SessionRegistry::new(),
            config: self.config,
        };

        Ok(BoundServer {
            socket,
            local_addr,
            context: Arc::new(context),
            shutdown: CancellationToken::new(),
        })
    }

    /// Binds and serves until shut down.
    pub async fn run(self) -> Result<()> {
        self.bind().await?.run().await
    }
}

/// Stops a running server. Cloneable so any task may hold one.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

pub struct BoundServer {
    socket: UdpSocket,
    local_addr: SocketAddr,
    context: Arc<ServerContext>,
    shutdown: CancellationToken,
}

/// A request accepted for a session.
struct Request {
    id: SessionId,
    direction: Direction,
    filename: String,
    mode: TransferMode,
    peer: SocketAddr,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    pub fn sessions(&self) -> SessionRegistry {
        self.context.registry.clone()
    }

    /// Serves requests until the shutdown handle fires, then cancels every
    /// active session and waits for all of them to finish.
    pub async fn run(self) -> Result<()> {
        let config = &self.context.config;
        self.context.audit.server_started(
            self.local_addr,
            &config.read_root,
            config.write_root(),
            mode_name(config.mode),
        );

        let mut workers = JoinSet::new();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    reap(joined);
                    continue;
                }
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, from)) => self.dispatch(&buf[..len], from, &mut workers).await,
                // ICMP unreachable left over from an earlier reply
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
                Err(e) => error!("Error receiving TFTP packet: {}", e),
            }
        }

        let active = self.context.registry.cancel_all();
        info!("Shutting down, cancelling {} active sessions", active);
        self.context.audit.server_shutdown("shutdown requested", active);

        while let Some(joined) = workers.join_next().await {
            reap(joined);
        }
        info!("TFTP server on {} stopped", self.local_addr);
        Ok(())
    }

    async fn dispatch(&self, datagram: &[u8], from: SocketAddr, workers: &mut JoinSet<()>) {
        let (direction, filename, mode) = match Packet::decode(datagram) {
            Ok(Packet::Rrq {
                filename,
                mode,
                options,
            }) => {
                debug!("RRQ from {}: {} ({}, options {:?})", from, filename, mode, options);
                (Direction::Read, filename, mode)
            }
            Ok(Packet::Wrq {
                filename,
                mode,
                options,
            }) => {
                debug!("WRQ from {}: {} ({}, options {:?})", from, filename, mode, options);
                (Direction::Write, filename, mode)
            }
            // never answer an error with an error
            Ok(Packet::Error { code, message }) => {
                debug!("Ignoring ERROR {} from {}: {}", code.as_u16(), from, message);
                return;
            }
            Ok(other) => {
                warn!("Unexpected {:?} from {} on the request port", other.opcode(), from);
                self.reply(from, ErrorCode::IllegalOperation, "Unexpected opcode")
                    .await;
                return;
            }
            Err(e) => {
                warn!("Malformed request from {}: {}", from, e);
                self.reply(from, ErrorCode::IllegalOperation, &e.to_string())
                    .await;
                return;
            }
        };

        // a request resent because our first reply was lost; the live
        // session keeps serving it
        if let Some(id) = self.context.registry.find(from, &filename, direction) {
            debug!("Duplicate {} request from {} for session {}", direction, from, id);
            return;
        }

        let cancel = self.shutdown.child_token();
        let guard = self.context.registry.register(SessionHandle {
            peer: from,
            filename: filename.clone(),
            direction,
            started: Instant::now(),
            cancel: cancel.clone(),
        });
        let request = Request {
            id: guard.id(),
            direction,
            filename,
            mode,
            peer: from,
        };

        let context = Arc::clone(&self.context);
        let bind_ip = self.local_addr.ip();
        workers.spawn(async move {
            context.serve(request, guard, cancel, bind_ip).await;
        });
    }

    async fn reply(&self, to: SocketAddr, code: ErrorCode, message: &str) {
        let packet = Packet::error(code, message);
        if let Err(e) = self.socket.send_to(&packet.encode(), to).await {
            debug!("Failed to send error to {}: {}", to, e);
        }
    }
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Session task panicked: {}", e);
        }
    }
}

fn mode_name(mode: ServerMode) -> &'static str {
    match mode {
        ServerMode::GetOnly => "get-only",
        ServerMode::PutOnly => "put-only",
        ServerMode::GetAndPut => "get-and-put",
    }
}

/// The ERROR code and message a failed open is reported with.
fn denial(err: TftpError) -> (ErrorCode, String) {
    match err {
        TftpError::Denied { code, message } => (code, message),
        TftpError::Io(e) if e.kind() == io::ErrorKind::NotFound => {
            (ErrorCode::FileNotFound, "File not found".to_string())
        }
        TftpError::Io(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            (ErrorCode::FileExists, "File already exists".to_string())
        }
        TftpError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            (ErrorCode::AccessViolation, "Access violation".to_string())
        }
        other => (other.error_code(), other.to_string()),
    }
}

/// State shared by every session of one server.
struct ServerContext {
    config: ServerConfig,
    registry: SessionRegistry,
    buffers: BufferPool,
    audit: AuditLogger,
}

impl ServerContext {
    async fn serve(
        &self,
        request: Request,
        _guard: SessionGuard,
        cancel: CancellationToken,
        bind_ip: IpAddr,
    ) {
        let id = request.id;
        let started = Instant::now();
        self.audit.request(
            id,
            request.direction,
            request.peer,
            &request.filename,
            request.mode.as_str(),
        );

        let socket = match bind_udp(SocketAddr::new(bind_ip, 0), &self.config.socket) {
            Ok(socket) => socket,
            Err(e) => {
                error!("Session {}: failed to bind transfer socket: {}", id, e);
                return;
            }
        };
        let mut transport =
            Transport::from_socket(socket, self.config.timeout()).with_cancellation(cancel);
        transport.begin_buffered_ops(&self.buffers);

        let result = match request.direction {
            Direction::Read => self.serve_read(&mut transport, &request).await,
            Direction::Write => self.serve_write(&mut transport, &request).await,
        };

        match result {
            Ok(stats) => {
                info!(
                    "Session {}: {} {} for {} complete ({} bytes, {} blocks, {} retransmissions)",
                    id,
                    request.direction,
                    request.filename,
                    request.peer,
                    stats.bytes,
                    stats.blocks,
                    stats.retransmissions
                );
                self.audit.transfer_completed(
                    id,
                    request.direction,
                    request.peer,
                    &request.filename,
                    &stats,
                    started.elapsed().as_millis() as u64,
                );
            }
            Err(TftpError::Denied { code, message }) => {
                warn!(
                    "Session {}: denied {} {} for {}: {}",
                    id, request.direction, request.filename, request.peer, message
                );
                self.audit.request_denied(
                    id,
                    request.direction,
                    request.peer,
                    &request.filename,
                    code,
                    &message,
                );
            }
            Err(TftpError::Cancelled) => {
                info!("Session {}: cancelled by shutdown", id);
                let goodbye = Packet::error(ErrorCode::NotDefined, "Server shutting down");
                if let Err(e) = transport.send(&goodbye, request.peer).await {
                    debug!("Session {}: failed to notify peer: {}", id, e);
                }
                self.audit.transfer_failed(
                    id,
                    request.direction,
                    request.peer,
                    &request.filename,
                    "cancelled",
                );
            }
            Err(e) => {
                error!(
                    "Session {}: {} {} for {} failed: {}",
                    id, request.direction, request.filename, request.peer, e
                );
                self.audit.transfer_failed(
                    id,
                    request.direction,
                    request.peer,
                    &request.filename,
                    &e.to_string(),
                );
            }
        }
    }

    fn settings(&self, mode: TransferMode) -> TransferSettings {
        TransferSettings::new(Role::Server, mode, self.config.max_retries)
    }

    /// Tells the peer why its request is refused and turns `err` into a
    /// [`TftpError::Denied`].
    async fn refuse<T>(
        &self,
        transport: &mut Transport,
        request: &Request,
        err: TftpError,
    ) -> Result<T> {
        if sandbox::is_violation(&err) {
            self.audit
                .path_traversal_attempt(request.id, request.peer, &request.filename);
        }
        let (code, message) = denial(err);
        transport
            .send(&Packet::error(code, message.clone()), request.peer)
            .await?;
        Err(TftpError::Denied { code, message })
    }

    /// Checks that apply before any filesystem access.
    async fn admit(
        &self,
        transport: &mut Transport,
        request: &Request,
        allowed: bool,
        refusal: &str,
    ) -> Result<()> {
        if !allowed {
            let err = TftpError::Denied {
                code: ErrorCode::IllegalOperation,
                message: refusal.to_string(),
            };
            return self.refuse(transport, request, err).await;
        }
        if request.mode == TransferMode::Mail {
            let err = TftpError::Denied {
                code: ErrorCode::IllegalOperation,
                message: "Mail mode not supported".to_string(),
            };
            return self.refuse(transport, request, err).await;
        }
        Ok(())
    }

    async fn serve_read(&self, transport: &mut Transport, request: &Request) -> Result<TransferStats> {
        self.admit(
            transport,
            request,
            self.config.mode.allows_read(),
            "Read not allowed by server.",
        )
        .await?;

        let path = match sandbox::resolve_read(&self.config.read_root, &request.filename) {
            Ok(path) => path,
            Err(e) => return self.refuse(transport, request, e).await,
        };

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => return self.refuse(transport, request, e.into()).await,
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            let err = TftpError::Denied {
                code: ErrorCode::FileNotFound,
                message: "Not a regular file".to_string(),
            };
            return self.refuse(transport, request, err).await;
        }
        if let Some(limit) = self.config.max_file_size() {
            if metadata.len() > limit {
                let err = TftpError::Denied {
                    code: ErrorCode::DiskFull,
                    message: "File too large".to_string(),
                };
                return self.refuse(transport, request, err).await;
            }
        }

        debug!("Serving {} ({} bytes) to {}", path.display(), metadata.len(), request.peer);
        transfer::send(
            transport,
            PeerIdentity::Established(request.peer),
            None,
            file,
            &self.settings(request.mode),
        )
        .await
    }

    async fn serve_write(&self, transport: &mut Transport, request: &Request) -> Result<TransferStats> {
        self.admit(
            transport,
            request,
            self.config.mode.allows_write(),
            "Write not allowed by server.",
        )
        .await?;

        let target = match sandbox::resolve_write(self.config.write_root(), &request.filename) {
            Ok(target) => target,
            Err(e) => return self.refuse(transport, request, e).await,
        };
        let path = &target.path;

        // create_new also catches a file that appears after the check above
        let file = match OpenOptions::new().write(true).create_new(true).open(path).await {
            Ok(file) => file,
            Err(e) => {
                discard_dirs(&target).await;
                return self.refuse(transport, request, e.into()).await;
            }
        };

        debug!("Receiving {} from {}", path.display(), request.peer);
        let settings = self
            .settings(request.mode)
            .with_max_bytes(self.config.max_file_size());
        let result = transfer::receive(
            transport,
            PeerIdentity::Established(request.peer),
            Packet::Ack { block: 0 },
            file,
            &settings,
        )
        .await;

        if result.is_err() {
            // partial uploads are never left behind
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("Failed to remove partial upload {}: {}", path.display(), e);
            }
            discard_dirs(&target).await;
        }
        result
    }
}

/// Removes the directories made for a failed upload. A directory another
/// session has written into since is not empty and stays.
async fn discard_dirs(target: &WriteTarget) {
    for dir in target.created_dirs() {
        if let Err(e) = tokio::fs::remove_dir(dir).await {
            debug!("Keeping directory {}: {}", dir.display(), e);
            break;
        }
    }
}
