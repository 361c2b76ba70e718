//! Concurrency controller for worker dispatches.
//!
//! Two limits apply to every dispatch:
//! - a project-wide pool of K slots, shared by all roles
//! - one slot per role, because a role's worker session is not reentrant
//!
//! A dispatch holds a [`DispatchPermit`] for its whole lifetime. Both slots
//! are released when the permit drops, whichever way the dispatch ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::tasks::Role;

/// Why a permit could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("dispatch cancelled while waiting for a slot")]
    Cancelled,
    #[error("dispatch pool closed")]
    Closed,
}

#[derive(Debug, Default)]
struct PoolStats {
    in_flight: AtomicUsize,
}

impl PoolStats {
    fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held by a running dispatch; releases its role slot and global slot on
/// drop.
#[derive(Debug)]
pub struct DispatchPermit {
    stats: Arc<PoolStats>,
    _global: OwnedSemaphorePermit,
    _role: OwnedSemaphorePermit,
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        self.stats.exit();
    }
}

/// Bounded pool of dispatch slots with per-role exclusivity.
#[derive(Debug, Clone)]
pub struct DispatchPool {
    capacity: usize,
    global: Arc<Semaphore>,
    roles: Arc<Mutex<HashMap<Role, Arc<Semaphore>>>>,
    stats: Arc<PoolStats>,
}

impl DispatchPool {
    /// Create a pool admitting at most `capacity` concurrent dispatches
    /// (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            global: Arc::new(Semaphore::new(capacity)),
            roles: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(PoolStats::default()),
        }
    }

    fn role_semaphore(&self, role: &Role) -> Arc<Semaphore> {
        let mut roles = self.roles.lock().unwrap_or_else(|e| e.into_inner());
        roles
            .entry(role.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    fn permit(
        &self,
        role: &Role,
        role_permit: OwnedSemaphorePermit,
        global_permit: OwnedSemaphorePermit,
    ) -> DispatchPermit {
        self.stats.enter();
        tracing::debug!(
            role = %role,
            in_flight = self.in_flight(),
            capacity = self.capacity,
            "dispatch slot acquired"
        );
        DispatchPermit {
            stats: Arc::clone(&self.stats),
            _global: global_permit,
            _role: role_permit,
        }
    }

    /// Wait for the role's slot and then a global slot. Waiters are served
    /// in FIFO order; `cancel` aborts the wait.
    pub async fn acquire(
        &self,
        role: &Role,
        cancel: &CancellationToken,
    ) -> Result<DispatchPermit, AcquireError> {
        let role_sem = self.role_semaphore(role);
        let role_permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            permit = role_sem.acquire_owned() => permit.map_err(|_| AcquireError::Closed)?,
        };
        let global_permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            permit = Arc::clone(&self.global).acquire_owned() => {
                permit.map_err(|_| AcquireError::Closed)?
            }
        };
        Ok(self.permit(role, role_permit, global_permit))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    /// Fail all current and future waiters. Held permits stay valid until
    /// dropped.
    pub fn close(&self) {
        self.global.close();
        let roles = self.roles.lock().unwrap_or_else(|e| e.into_inner());
        for sem in roles.values() {
            sem.close();
        }
    }
}
