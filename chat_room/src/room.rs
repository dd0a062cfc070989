use crate::client::{client_channel, ClientId, ClientMailbox};
use crate::config::RoomSettings;
use crate::db::DbPool;
use crate::error::{ChatError, Result};
use crate::hub::{Hub, HubRegistry};
use crate::identity::Identity;
use crate::images::ImageCache;
use crate::messages::{checked_room, MessageStore, NewMessage};
use bytes::Bytes;
use room_api::{ChatMessage, SendMessage, ServerEvent, UploadedImage};
use std::sync::Arc;
use tracing::{debug, warn};

/// The chat room service: validation, persistence, fan-out and retention.
#[derive(Clone)]
pub struct ChatRoom {
    settings: Arc<RoomSettings>,
    store: MessageStore,
    images: ImageCache,
    hubs: HubRegistry,
}

/// A live connection to one room's hub.
pub struct Subscription {
    pub room: String,
    pub hub: Hub,
    pub mailbox: ClientMailbox,
}

impl ChatRoom {
    pub fn new(settings: RoomSettings, pool: DbPool) -> Self {
        let store = MessageStore::new(pool);
        let images = ImageCache::new(store.clone(), settings.image_dir.clone());
        Self {
            settings: Arc::new(settings),
            store,
            images,
            hubs: HubRegistry::new(),
        }
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    /// Register a new client with the hub of `room`.
    pub async fn subscribe(&self, room: Option<&str>, identity: &Identity) -> Result<Subscription> {
        if !self.settings.enabled {
            return Err(ChatError::RoomDisabled);
        }
        let room = checked_room(room)?;
        let (handle, mailbox) = client_channel(identity.user_id, self.settings.client_buffer);
        let hub = self.hubs.hub(&room);
        hub.register(handle).await?;
        Ok(Subscription { room, hub, mailbox })
    }

    /// Remove a client from its room and stop the room's hub once no other
    /// connection holds it.
    pub async fn unsubscribe(&self, room: &str, hub: Hub, client: ClientId) {
        if let Err(e) = hub.unregister(client).await {
            debug!(room, client = %client, error = %e, "unregister failed");
        }
        drop(hub);
        self.hubs.release(room);
    }

    /// Number of rooms with a running hub.
    pub fn active_rooms(&self) -> usize {
        self.hubs.len()
    }

    /// Stop hubs that no connection holds any more. Returns how many stopped.
    pub fn release_idle_hubs(&self) -> usize {
        self.hubs.prune()
    }

    /// A page of room history in chronological order.
    pub async fn history(&self, room: &str, limit: i64, before_id: i64) -> Result<Vec<ChatMessage>> {
        let store = self.store.clone();
        let room = room.to_string();
        tokio::task::spawn_blocking(move || store.list(&room, limit, before_id)).await?
    }

    /// Validate, persist and broadcast a message, then apply retention.
    ///
    /// A message that fails to persist is never broadcast. Retention failures
    /// after a successful insert are logged and do not fail the post.
    pub async fn post(&self, author: &Identity, req: SendMessage) -> Result<ChatMessage> {
        if !self.settings.enabled {
            return Err(ChatError::RoomDisabled);
        }
        let room = checked_room(req.room.as_deref())?;
        let max = self.settings.max_message_length;
        if req.content.chars().count() > max {
            return Err(ChatError::ContentTooLong { max });
        }
        if !req.image_urls.is_empty() && !self.settings.image_enabled {
            return Err(ChatError::ImagesDisabled);
        }
        let mut image_urls = Vec::with_capacity(req.image_urls.len());
        for url in req.image_urls {
            let url = self
                .images
                .canonical_url(&url)
                .ok_or(ChatError::InvalidImage(url))?;
            if !image_urls.contains(&url) {
                image_urls.push(url);
            }
        }

        let this = self.clone();
        let author = author.clone();
        let msg = tokio::task::spawn_blocking(move || {
            let image_total_bytes = this.images.measure(&image_urls)?;
            this.store.insert(NewMessage {
                room: Some(room),
                user_id: author.user_id,
                username: author.username,
                display_name: author.display_name,
                content: req.content,
                image_urls,
                image_total_bytes,
            })
        })
        .await??;

        let payload = serde_json::to_vec(&ServerEvent::Message {
            message: msg.clone(),
        })?;
        if let Some(hub) = self.hubs.get(&msg.room) {
            if let Err(e) = hub.broadcast(payload).await {
                warn!(room = %msg.room, error = %e, "broadcast failed");
            }
        }

        let this = self.clone();
        let room = msg.room.clone();
        let has_images = msg.has_images();
        if let Err(e) =
            tokio::task::spawn_blocking(move || this.apply_retention(&room, has_images)).await
        {
            warn!(error = %e, "retention task failed");
        }
        Ok(msg)
    }

    /// Store an uploaded image in the cache directory.
    pub async fn upload_image(&self, data: Bytes) -> Result<UploadedImage> {
        if !self.settings.enabled {
            return Err(ChatError::RoomDisabled);
        }
        if !self.settings.image_enabled {
            return Err(ChatError::ImagesDisabled);
        }
        self.images.save(data, self.settings.image_max_bytes).await
    }

    /// Trim one room to the message limit and release the images of trimmed
    /// rows. Returns the number of deleted messages.
    pub fn trim_room(&self, room: &str) -> Result<usize> {
        let trimmed = self.store.trim(room, self.settings.message_limit)?;
        if !trimmed.is_empty() {
            let files = self.images.delete_message_images(&trimmed);
            debug!(room, trimmed = trimmed.len(), files, "room trimmed");
        }
        Ok(trimmed.len())
    }

    /// Evict old image messages until the image budget holds.
    pub fn enforce_image_budget(&self) -> Result<usize> {
        self.images
            .enforce_budget(self.settings.image_cache_max_bytes)
    }

    fn apply_retention(&self, room: &str, has_images: bool) {
        if let Err(e) = self.trim_room(room) {
            warn!(room, error = %e, "trim failed");
        }
        if has_images {
            if let Err(e) = self.enforce_image_budget() {
                warn!(error = %e, "image budget enforcement failed");
            }
        }
    }
}
