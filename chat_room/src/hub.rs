use crate::client::{ClientHandle, ClientId};
use crate::error::{ChatError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::debug;

/// Capacity of the hub's command mailbox. Senders wait when it is full.
pub const HUB_MAILBOX_CAPACITY: usize = 256;

enum Command {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(Bytes),
    Count(oneshot::Sender<usize>),
}

/// Handle to a room's broadcast hub.
///
/// The live client set is owned by a single task; every operation is a
/// command processed in submission order, so no lock guards the set.
#[derive(Clone)]
pub struct Hub {
    tx: Arc<mpsc::Sender<Command>>,
}

impl Hub {
    /// Start a hub task. Must be called inside a Tokio runtime. The task ends
    /// once every `Hub` clone has been dropped.
    pub fn spawn(room: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(HUB_MAILBOX_CAPACITY);
        tokio::spawn(run(room.into(), rx));
        Self { tx: Arc::new(tx) }
    }

    /// Add a client to the live set.
    pub async fn register(&self, client: ClientHandle) -> Result<()> {
        self.submit(Command::Register(client)).await
    }

    /// Remove a client and close its queue. Unknown ids are ignored.
    pub async fn unregister(&self, id: ClientId) -> Result<()> {
        self.submit(Command::Unregister(id)).await
    }

    /// Fan a payload out to every live client. Clients whose queue is full are
    /// dropped instead of being waited on. Empty payloads are ignored.
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.is_empty() {
            return Ok(());
        }
        self.submit(Command::Broadcast(payload)).await
    }

    /// Number of live clients once all earlier commands have been applied.
    pub async fn client_count(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Count(reply)).await?;
        rx.await.map_err(|_| ChatError::HubClosed)
    }

    async fn submit(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| ChatError::HubClosed)
    }

    fn is_shared(&self) -> bool {
        Arc::strong_count(&self.tx) > 1
    }
}

async fn run(room: String, mut rx: mpsc::Receiver<Command>) {
    let mut clients: HashMap<ClientId, ClientHandle> = HashMap::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Register(client) => {
                debug!(room = %room, client = %client.id(), user = client.user_id(), "client registered");
                clients.insert(client.id(), client);
            }
            Command::Unregister(id) => {
                if clients.remove(&id).is_some() {
                    debug!(room = %room, client = %id, "client unregistered");
                }
            }
            Command::Broadcast(payload) => {
                clients.retain(|id, client| match client.try_deliver(payload.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        debug!(room = %room, client = %id, "dropping slow client");
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
            Command::Count(reply) => {
                let _ = reply.send(clients.len());
            }
        }
    }
    debug!(room = %room, "hub stopped");
}

/// Lazily creates one hub per room. A room's hub is stopped once the
/// registry holds the only handle to it.
#[derive(Clone, Default)]
pub struct HubRegistry {
    hubs: Arc<Mutex<HashMap<String, Hub>>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The hub for `room`, started on first use.
    pub fn hub(&self, room: &str) -> Hub {
        self.hubs
            .lock()
            .entry(room.to_string())
            .or_insert_with(|| Hub::spawn(room))
            .clone()
    }

    /// The running hub for `room`, if any. Never starts one.
    pub fn get(&self, room: &str) -> Option<Hub> {
        self.hubs.lock().get(room).cloned()
    }

    /// Stop the hub of `room` if no handle outside the registry remains.
    /// Returns whether it was stopped.
    pub fn release(&self, room: &str) -> bool {
        let mut hubs = self.hubs.lock();
        match hubs.get(room) {
            Some(hub) if !hub.is_shared() => {
                hubs.remove(room);
                debug!(room, "hub released");
                true
            }
            _ => false,
        }
    }

    /// Stop every hub that only the registry still holds.
    pub fn prune(&self) -> usize {
        let mut hubs = self.hubs.lock();
        let before = hubs.len();
        hubs.retain(|_, hub| hub.is_shared());
        before - hubs.len()
    }

    pub fn len(&self) -> usize {
        self.hubs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{client_channel, ClientMailbox};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn expect(mailbox: &mut ClientMailbox, want: &'static [u8]) {
        let got = timeout(Duration::from_secs(1), mailbox.recv())
            .await
            .expect("delivery timed out");
        assert_eq!(got, Some(Bytes::from_static(want)));
    }

    async fn expect_closed(mailbox: &mut ClientMailbox) {
        let got = timeout(Duration::from_secs(1), mailbox.recv())
            .await
            .expect("close timed out");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn register_broadcast_unregister() {
        let hub = Hub::spawn("global");
        let (a, mut a_rx) = client_channel(1, 8);
        let (b, mut b_rx) = client_channel(2, 8);
        let b_id = b.id();
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        hub.broadcast("one").await.unwrap();
        hub.unregister(b_id).await.unwrap();
        hub.unregister(b_id).await.unwrap();
        hub.broadcast("two").await.unwrap();
        assert_eq!(hub.client_count().await.unwrap(), 1);

        expect(&mut a_rx, b"one").await;
        expect(&mut a_rx, b"two").await;
        expect(&mut b_rx, b"one").await;
        expect_closed(&mut b_rx).await;
    }

    #[tokio::test]
    async fn slow_client_is_dropped_without_stalling_others() {
        let hub = Hub::spawn("global");
        let (stalled, mut stalled_rx) = client_channel(1, 1);
        let (healthy, mut healthy_rx) = client_channel(2, 8);
        hub.register(stalled).await.unwrap();
        hub.register(healthy).await.unwrap();

        hub.broadcast("a").await.unwrap();
        hub.broadcast("b").await.unwrap();
        hub.broadcast("c").await.unwrap();
        assert_eq!(hub.client_count().await.unwrap(), 1);

        expect(&mut healthy_rx, b"a").await;
        expect(&mut healthy_rx, b"b").await;
        expect(&mut healthy_rx, b"c").await;
        expect(&mut stalled_rx, b"a").await;
        expect_closed(&mut stalled_rx).await;
    }

    #[tokio::test]
    async fn empty_payload_is_ignored() {
        let hub = Hub::spawn("global");
        let (c, mut rx) = client_channel(1, 1);
        hub.register(c).await.unwrap();
        hub.broadcast(Bytes::new()).await.unwrap();
        hub.broadcast("real").await.unwrap();
        assert_eq!(hub.client_count().await.unwrap(), 1);
        expect(&mut rx, b"real").await;
    }

    #[tokio::test]
    async fn closed_mailbox_is_pruned() {
        let hub = Hub::spawn("global");
        let (c, rx) = client_channel(1, 4);
        hub.register(c).await.unwrap();
        drop(rx);
        hub.broadcast("x").await.unwrap();
        assert_eq!(hub.client_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_membership_is_consistent() {
        let hub = Hub::spawn("global");
        let noise = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    hub.broadcast("tick").await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let mut tasks = Vec::new();
        for i in 0..20 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let (c, rx) = client_channel(i, 128);
                let id = c.id();
                hub.register(c).await.unwrap();
                tokio::task::yield_now().await;
                if i % 2 == 0 {
                    hub.unregister(id).await.unwrap();
                }
                rx
            }));
        }
        let mut mailboxes = Vec::new();
        for t in tasks {
            mailboxes.push(t.await.unwrap());
        }
        noise.await.unwrap();
        assert_eq!(hub.client_count().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn registry_shares_hub_per_room() {
        let registry = HubRegistry::new();
        let (c, _rx) = client_channel(1, 4);
        registry.hub("lobby").register(c).await.unwrap();
        assert_eq!(registry.hub("lobby").client_count().await.unwrap(), 1);
        assert_eq!(registry.hub("other").client_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn idle_hubs_are_released() {
        let registry = HubRegistry::new();
        for i in 0..1000 {
            let room = format!("room-{i}");
            let hub = registry.hub(&room);
            hub.broadcast("x").await.unwrap();
            drop(hub);
            assert!(registry.release(&room));
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn held_hub_is_kept_until_its_last_handle_goes() {
        let registry = HubRegistry::new();
        let hub = registry.hub("lobby");
        let (c, mut rx) = client_channel(1, 4);
        let id = c.id();
        hub.register(c).await.unwrap();
        assert!(!registry.release("lobby"));
        assert_eq!(registry.prune(), 0);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("missing").is_none());

        hub.unregister(id).await.unwrap();
        drop(hub);
        assert!(registry.release("lobby"));
        assert!(registry.get("lobby").is_none());
        expect_closed(&mut rx).await;
    }

    #[tokio::test]
    async fn prune_sweeps_every_idle_hub() {
        let registry = HubRegistry::new();
        let kept = registry.hub("kept");
        drop(registry.hub("a"));
        drop(registry.hub("b"));
        assert_eq!(registry.prune(), 2);
        assert_eq!(registry.len(), 1);
        drop(kept);
        assert_eq!(registry.prune(), 1);
        assert!(registry.is_empty());
    }
}
