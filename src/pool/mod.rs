//! Bounded, non-blocking resource pool
//!
//! The pool hands out resources created by a [`ManageResource`] implementation.
//! Every handle is tracked as either *active* (held by a caller) or *available*
//! (idle, ready for reuse), never both, and the total never exceeds
//! `max_connections`. Acquisition fails immediately instead of waiting when
//! the pool is exhausted.

mod sqlite;

pub use sqlite::{with_transaction, SqliteManager, SqlitePool};

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors raised by [`ConnectionPool`]
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool exhausted ({max} connections in use)")]
    Exhausted { max: usize },

    #[error("connection pool is closed")]
    Closed,

    #[error("connection is not active in this pool")]
    NotActive,

    #[error("failed to connect to {target}: {message}")]
    Connect { target: String, message: String },
}

/// Creates and disposes of pooled resources
pub trait ManageResource: Send + Sync {
    type Resource: Send;

    /// Human-readable description of what the resources connect to
    fn target(&self) -> &str;

    fn connect(&self) -> Result<Self::Resource, PoolError>;

    fn close(&self, resource: Self::Resource) {
        drop(resource);
    }
}

struct PoolState<R> {
    available: Vec<(u64, R)>,
    active: HashSet<u64>,
    next_handle: u64,
    closed: bool,
}

/// State shared between a pool and the connections it has handed out
struct Shared<M: ManageResource> {
    manager: M,
    max_connections: usize,
    state: Mutex<PoolState<M::Resource>>,
}

impl<M: ManageResource> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Resource>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves a handle from active to available, or closes it
    fn check_in(&self, handle_id: u64, resource: M::Resource) -> Result<(), PoolError> {
        let mut state = self.lock();

        if state.closed {
            drop(state);
            self.manager.close(resource);
            return Err(PoolError::Closed);
        }

        if !state.active.remove(&handle_id) {
            drop(state);
            self.manager.close(resource);
            return Err(PoolError::NotActive);
        }

        state.available.push((handle_id, resource));
        Ok(())
    }
}

/// A resource checked out of a [`ConnectionPool`]
///
/// The resource goes back to its pool when this handle is dropped, including
/// while unwinding, so an early return never leaks a slot. Once the pool is
/// closed, dropping the handle closes the resource instead.
pub struct PooledConnection<M: ManageResource> {
    pool: Arc<Shared<M>>,
    handle_id: u64,
    resource: Option<M::Resource>,
}

impl<M: ManageResource> PooledConnection<M> {
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }
}

impl<M: ManageResource> Deref for PooledConnection<M> {
    type Target = M::Resource;

    fn deref(&self) -> &M::Resource {
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<M: ManageResource> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut M::Resource {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<M: ManageResource> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if let Err(e) = self.pool.check_in(self.handle_id, resource) {
                tracing::debug!(
                    handle_id = self.handle_id,
                    error = %e,
                    "pooled connection closed on drop"
                );
            }
        }
    }
}

impl<M: ManageResource> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("target", &self.pool.manager.target())
            .field("handle_id", &self.handle_id)
            .finish()
    }
}

/// Fixed-capacity pool of resources produced by `M`
pub struct ConnectionPool<M: ManageResource> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageResource> ConnectionPool<M> {
    /// Creates an empty pool; resources are created lazily on acquire.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(manager: M, max_connections: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                max_connections: max_connections.max(1),
                state: Mutex::new(PoolState {
                    available: Vec::new(),
                    active: HashSet::new(),
                    next_handle: 1,
                    closed: false,
                }),
            }),
        }
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn target(&self) -> &str {
        self.shared.manager.target()
    }

    pub fn max_connections(&self) -> usize {
        self.shared.max_connections
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active.len()
    }

    pub fn available_count(&self) -> usize {
        self.shared.lock().available.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Checks out a resource without blocking
    ///
    /// Idle resources are reused before new ones are created.
    ///
    /// # Errors
    ///
    /// * `PoolError::Closed` - the pool has been closed
    /// * `PoolError::Exhausted` - every slot is active
    /// * `PoolError::Connect` - creating a new resource failed
    pub fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        let shared = &self.shared;
        let mut state = shared.lock();

        if state.closed {
            return Err(PoolError::Closed);
        }

        if let Some((handle_id, resource)) = state.available.pop() {
            state.active.insert(handle_id);
            return Ok(self.wrap(handle_id, resource));
        }

        if state.active.len() + state.available.len() >= shared.max_connections {
            tracing::debug!(
                target_name = %shared.manager.target(),
                max = shared.max_connections,
                "connection pool exhausted"
            );
            return Err(PoolError::Exhausted {
                max: shared.max_connections,
            });
        }

        let resource = shared.manager.connect()?;
        let handle_id = state.next_handle;
        state.next_handle += 1;
        state.active.insert(handle_id);

        tracing::trace!(handle_id, target_name = %shared.manager.target(), "opened pooled connection");
        Ok(self.wrap(handle_id, resource))
    }

    /// Returns a resource to the idle set
    ///
    /// A connection from another pool is rejected with `NotActive` and goes
    /// back to the pool it came from. After `close` the resource is closed
    /// and `Closed` is returned.
    pub fn release(&self, mut conn: PooledConnection<M>) -> Result<(), PoolError> {
        if !Arc::ptr_eq(&self.shared, &conn.pool) {
            return Err(PoolError::NotActive);
        }

        match conn.resource.take() {
            Some(resource) => self.shared.check_in(conn.handle_id, resource),
            None => Err(PoolError::NotActive),
        }
    }

    /// Acquires a resource for the current scope
    ///
    /// Same as [`acquire`](Self::acquire); the handle releases itself on drop.
    pub fn get(&self) -> Result<PooledConnection<M>, PoolError> {
        self.acquire()
    }

    /// Closes the pool
    ///
    /// Idle resources are closed now. Active handles are closed as their
    /// holders release or drop them. Calling this twice is a no-op.
    pub fn close(&self) {
        let (idle, outstanding) = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let outstanding = state.active.len();
            state.active.clear();
            (std::mem::take(&mut state.available), outstanding)
        };

        let count = idle.len();
        for (_, resource) in idle {
            self.shared.manager.close(resource);
        }

        tracing::debug!(
            target_name = %self.shared.manager.target(),
            closed = count,
            outstanding,
            "connection pool closed"
        );
    }

    fn wrap(&self, handle_id: u64, resource: M::Resource) -> PooledConnection<M> {
        PooledConnection {
            pool: self.shared.clone(),
            handle_id,
            resource: Some(resource),
        }
    }
}

impl<M: ManageResource> Drop for ConnectionPool<M> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<M: ManageResource> std::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ConnectionPool")
            .field("target", &self.shared.manager.target())
            .field("max_connections", &self.shared.max_connections)
            .field("active", &state.active.len())
            .field("available", &state.available.len())
            .field("closed", &state.closed)
            .finish()
    }
}
