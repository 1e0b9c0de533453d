//! Active session registry
//!
//! Every server session is registered when its task is spawned and removed
//! when the task ends, however it ends. Shutdown cancels a snapshot of the
//! registry so sessions finishing concurrently never race the iteration.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a transfer, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Serving a read request
    Read,
    /// Accepting a write request
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub peer: SocketAddr,
    pub filename: String,
    pub direction: Direction,
    pub started: Instant,
    pub cancel: CancellationToken,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Sessions only insert and remove; a panic mid-update cannot leave the
    // map inconsistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a session and returns a guard that removes it when dropped.
    pub fn register(&self, handle: SessionHandle) -> SessionGuard {
        let id = SessionId::new();
        debug!(
            "Registering session {} ({} {} for {})",
            id, handle.direction, handle.filename, handle.peer
        );
        self.lock().insert(id, handle);
        SessionGuard {
            id,
            registry: self.clone(),
        }
    }

    pub fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.lock().get(&id).cloned()
    }

    /// The live session already serving `direction` of `filename` for `peer`,
    /// if any. A retransmitted request matches its own session here.
    pub fn find(
        &self,
        peer: SocketAddr,
        filename: &str,
        direction: Direction,
    ) -> Option<SessionId> {
        self.lock()
            .iter()
            .find(|(_, handle)| {
                handle.peer == peer && handle.direction == direction && handle.filename == filename
            })
            .map(|(id, _)| *id)
    }

    /// A copy of the current sessions, taken under the lock.
    pub fn snapshot(&self) -> Vec<(SessionId, SessionHandle)> {
        self.lock()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    /// Signals every session registered at the time of the call to stop.
    /// Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let sessions = self.snapshot();
        for (id, handle) in &sessions {
            debug!("Cancelling session {} for {}", id, handle.peer);
            handle.cancel.cancel();
        }
        sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Removes its session from the registry on drop.
pub struct SessionGuard {
    id: SessionId,
    registry: SessionRegistry,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
