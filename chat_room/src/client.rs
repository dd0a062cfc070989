use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Outbound queue size used when the caller asks for zero.
pub const DEFAULT_CLIENT_BUFFER: usize = 64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection id. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Producer side of a connection's outbound queue. Moved into the hub on
/// registration, so only the hub ever enqueues into it.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    user_id: i64,
    tx: mpsc::Sender<Bytes>,
}

/// Consumer side kept by the session that owns the connection.
#[derive(Debug)]
pub struct ClientMailbox {
    id: ClientId,
    rx: mpsc::Receiver<Bytes>,
}

/// Create a bounded outbound queue for one connection.
pub fn client_channel(user_id: i64, capacity: usize) -> (ClientHandle, ClientMailbox) {
    let capacity = if capacity == 0 {
        DEFAULT_CLIENT_BUFFER
    } else {
        capacity
    };
    let id = ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = mpsc::channel(capacity);
    (ClientHandle { id, user_id, tx }, ClientMailbox { id, rx })
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Enqueue without waiting. Fails when the queue is full or the session is gone.
    pub(crate) fn try_deliver(&self, payload: Bytes) -> Result<(), TrySendError<Bytes>> {
        self.tx.try_send(payload)
    }
}

impl ClientMailbox {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Next payload, or `None` once the hub has dropped this client and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}
