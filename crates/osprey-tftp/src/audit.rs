use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{Level, event};

use crate::packet::ErrorCode;
use crate::session::{Direction, SessionId};
use crate::transfer::TransferStats;

/// Structured audit events, emitted as one JSON object per event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        read_root: String,
        write_root: String,
        mode: String,
    },

    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
        active_sessions: usize,
    },

    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
    },

    WriteRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
    },

    /// A request refused by server policy before any data moved
    RequestDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        direction: String,
        error_code: u16,
        reason: String,
    },

    PathTraversalAttempt {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        requested_path: String,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        direction: String,
        bytes_transferred: u64,
        blocks: u64,
        retransmissions: u64,
        duration_ms: u64,
    },

    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        direction: String,
        error: String,
    },
}

/// Fields shared by every audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error
    pub severity: String,
    /// Session the event belongs to, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "osprey-tftp".to_string(),
            severity: severity.to_string(),
            correlation_id: None,
        }
    }

    pub fn for_session(severity: &str, session: SessionId) -> Self {
        let mut fields = Self::new(severity);
        fields.correlation_id = Some(session.to_string());
        fields
    }
}

impl AuditEvent {
    pub fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::RequestDenied { common, .. }
            | AuditEvent::PathTraversalAttempt { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. } => common,
        }
    }

    /// Emit this event through `tracing` at its severity
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                self
            )
        });

        match self.common().severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }
}

/// Emits audit events when auditing is enabled
#[derive(Debug, Clone, Copy)]
pub struct AuditLogger {
    enabled: bool,
}

impl AuditLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn emit(&self, event: impl FnOnce() -> AuditEvent) {
        if self.enabled {
            event().log();
        }
    }

    pub fn server_started(&self, bind_addr: SocketAddr, read_root: &Path, write_root: &Path, mode: &str) {
        self.emit(|| AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            read_root: read_root.display().to_string(),
            write_root: write_root.display().to_string(),
            mode: mode.to_string(),
        });
    }

    pub fn server_shutdown(&self, reason: &str, active_sessions: usize) {
        self.emit(|| AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
            active_sessions,
        });
    }

    pub fn request(
        &self,
        session: SessionId,
        direction: Direction,
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
    ) {
        self.emit(|| {
            let common = CommonFields::for_session("info", session);
            let client_addr = client_addr.to_string();
            let filename = filename.to_string();
            let mode = mode.to_string();
            match direction {
                Direction::Read => AuditEvent::ReadRequest {
                    common,
                    client_addr,
                    filename,
                    mode,
                },
                Direction::Write => AuditEvent::WriteRequest {
                    common,
                    client_addr,
                    filename,
                    mode,
                },
            }
        });
    }

    pub fn request_denied(
        &self,
        session: SessionId,
        direction: Direction,
        client_addr: SocketAddr,
        filename: &str,
        code: ErrorCode,
        reason: &str,
    ) {
        self.emit(|| AuditEvent::RequestDenied {
            common: CommonFields::for_session("warn", session),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            direction: direction.to_string(),
            error_code: code.as_u16(),
            reason: reason.to_string(),
        });
    }

    pub fn path_traversal_attempt(&self, session: SessionId, client_addr: SocketAddr, requested_path: &str) {
        self.emit(|| AuditEvent::PathTraversalAttempt {
            common: CommonFields::for_session("error", session),
            client_addr: client_addr.to_string(),
            requested_path: requested_path.to_string(),
        });
    }

    pub fn transfer_completed(
        &self,
        session: SessionId,
        direction: Direction,
        client_addr: SocketAddr,
        filename: &str,
        stats: &TransferStats,
        duration_ms: u64,
    ) {
        self.emit(|| AuditEvent::TransferCompleted {
            common: CommonFields::for_session("info", session),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            direction: direction.to_string(),
            bytes_transferred: stats.bytes,
            blocks: stats.blocks,
            retransmissions: stats.retransmissions,
            duration_ms,
        });
    }

    pub fn transfer_failed(
        &self,
        session: SessionId,
        direction: Direction,
        client_addr: SocketAddr,
        filename: &str,
        error: &str,
    ) {
        self.emit(|| AuditEvent::TransferFailed {
            common: CommonFields::for_session("error", session),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            direction: direction.to_string(),
            error: error.to_string(),
        });
    }
}
