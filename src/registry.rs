//! Process-wide index of in-flight transfers.
//!
//! At most one task exists per `FileIdentity` key. Every admission goes
//! through `try_register`/`acquire`; a `false`/`Err` result means another
//! connection owns the key and the caller must back off.

use crate::status::TransferStatus;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stable handle of a connection, assigned by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Task {
    status: TransferStatus,
    /// Diagnostic back-reference only; the registry owns the entry
    owner: ConnectionId,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of the task in flight for `key`, `None` when there is none.
    pub fn lookup(&self, key: &str) -> Option<TransferStatus> {
        self.tasks.lock().get(key).map(|t| t.status)
    }

    /// Test-and-set. Inserts iff `key` is absent; otherwise leaves the
    /// registry untouched and returns the status already registered.
    fn admit(&self, key: &str, status: TransferStatus, owner: ConnectionId) -> Result<(), TransferStatus> {
        let mut tasks = self.tasks.lock();
        if let Some(existing) = tasks.get(key) {
            warn!(key, %owner, holder = %existing.owner, status = %existing.status, "duplicate task");
            return Err(existing.status);
        }
        tasks.insert(key.to_string(), Task { status, owner });
        debug!(key, %owner, %status, "task registered");
        Ok(())
    }

    pub fn try_register(&self, key: &str, status: TransferStatus, owner: ConnectionId) -> bool {
        self.admit(key, status, owner).is_ok()
    }

    /// Remove `key` only if `owner` holds it. Returns whether an entry was removed.
    pub fn remove(&self, key: &str, owner: ConnectionId) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get(key) {
            Some(t) if t.owner == owner => {
                tasks.remove(key);
                debug!(key, %owner, "task removed");
                true
            }
            Some(t) => {
                debug!(key, %owner, holder = %t.owner, "task held by another connection, not removed");
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Register and return a lease that unregisters on drop.
    /// `Err` carries the status of the task that already owns `key`.
    pub fn acquire(
        self: &Arc<Self>,
        key: &str,
        status: TransferStatus,
        owner: ConnectionId,
    ) -> Result<TaskLease, TransferStatus> {
        self.admit(key, status, owner)?;
        Ok(TaskLease {
            registry: Arc::clone(self),
            key: key.to_string(),
            owner,
            status,
        })
    }
}

/// Ownership of one registry entry for the lifetime of a transfer.
#[derive(Debug)]
pub struct TaskLease {
    registry: Arc<TaskRegistry>,
    key: String,
    owner: ConnectionId,
    status: TransferStatus,
}

impl TaskLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        self.registry.remove(&self.key, self.owner);
    }
}
