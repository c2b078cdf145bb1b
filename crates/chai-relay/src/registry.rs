//! Live connection registry: `user_id -> connection`.
//!
//! Single-device policy is latest-wins: registering a user who already has
//! a connection hands the old handle back so the caller can close it with
//! `Replaced`. Closing a connection removes its entry, never the other way
//! around.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chai_protocol::{ErrorCode, ServerFrame, UserId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};

/// Bound on each connection's outbound queue. Overflow closes the
/// connection with `Backpressure`; the client reconnects and re-drains.
pub const OUTBOUND_QUEUE: usize = 64;

/// Out-of-band close request for a connection task.
pub struct CloseSignal {
    notify: Notify,
    reason: Mutex<Option<ErrorCode>>,
}

impl CloseSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
            reason: Mutex::new(None),
        })
    }

    pub fn close(&self, code: ErrorCode) {
        *self.reason.lock() = Some(code);
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn reason(&self) -> Option<ErrorCode> {
        *self.reason.lock()
    }
}

/// Handle to one attached connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub connection_id: u64,
    outbound: mpsc::Sender<ServerFrame>,
    close: Arc<CloseSignal>,
}

impl ConnectionHandle {
    pub fn close(&self, code: ErrorCode) {
        self.close.close(code);
    }
}

/// Outcome of a delivery attempt to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Offline,
    /// The recipient's queue overflowed; its connection is being closed.
    Overflow,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection, returning its id and any replaced handle.
    pub fn register(
        &self,
        user_id: UserId,
        outbound: mpsc::Sender<ServerFrame>,
        close: Arc<CloseSignal>,
    ) -> (u64, Option<ConnectionHandle>) {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle {
            connection_id,
            outbound,
            close,
        };
        let replaced = self.connections.write().insert(user_id, handle);
        (connection_id, replaced)
    }

    /// Remove a connection entry, but only if it still belongs to the
    /// caller (a replacement may have taken the slot already).
    pub fn remove(&self, user_id: UserId, connection_id: u64) {
        let mut connections = self.connections.write();
        if connections
            .get(&user_id)
            .is_some_and(|h| h.connection_id == connection_id)
        {
            connections.remove(&user_id);
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections.read().contains_key(&user_id)
    }

    /// Queue a frame for a user's live connection, enforcing the bounded
    /// queue.
    pub fn deliver(&self, user_id: UserId, frame: ServerFrame) -> Delivery {
        let handle = match self.connections.read().get(&user_id) {
            Some(h) => h.clone(),
            None => return Delivery::Offline,
        };
        match handle.outbound.try_send(frame) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                handle.close(ErrorCode::Backpressure);
                self.remove(user_id, handle.connection_id);
                Delivery::Overflow
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Offline,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
