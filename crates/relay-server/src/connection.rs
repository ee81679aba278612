//! One live WebSocket peer as seen by the hub.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relay_core::{ConnectionId, Role, SessionId};
use tokio::sync::mpsc;

use crate::error::ChatError;

/// The session a connection participates in, and on which side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub session_id: SessionId,
    pub role: Role,
}

/// Result of a non-blocking enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Buffer at capacity; the peer is not draining.
    Full,
    /// Buffer already closed by teardown or eviction.
    Closed,
}

pub struct Connection {
    id: ConnectionId,
    binding: OnceLock<Binding>,
    /// Sole sender for the egress pump. Taking it closes the buffer.
    outbound: Mutex<Option<mpsc::Sender<Arc<String>>>>,
    connected_at: Instant,
}

impl Connection {
    /// New unbound connection plus the receiving end of its outbound buffer.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            binding: OnceLock::new(),
            outbound: Mutex::new(Some(tx)),
            connected_at: Instant::now(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Bind to a session. A binding never changes once set; re-binding to the
    /// identical session and role is accepted as a no-op.
    pub fn bind(&self, session_id: SessionId, role: Role) -> Result<(), ChatError> {
        let wanted = Binding { session_id, role };
        match self.binding.set(wanted.clone()) {
            Ok(()) => Ok(()),
            Err(_) => match self.binding.get() {
                Some(existing) if *existing == wanted => Ok(()),
                Some(existing) => Err(ChatError::AlreadyBound(existing.session_id.clone())),
                None => Err(ChatError::Unbound),
            },
        }
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.get()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.binding.get().map(|b| &b.session_id)
    }

    pub fn role(&self) -> Option<Role> {
        self.binding.get().map(|b| b.role)
    }

    pub fn try_enqueue(&self, payload: Arc<String>) -> Enqueue {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Enqueue::Closed;
        };
        match tx.try_send(payload) {
            Ok(()) => Enqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Close the outbound buffer. Frames already queued still drain, then the
    /// egress pump sees the end of the channel. Returns `true` only for the
    /// call that actually closed it.
    pub fn close(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("binding", &self.binding.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}
