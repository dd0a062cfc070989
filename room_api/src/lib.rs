use serde::{Deserialize, Serialize};

/// Room used when a request names no room or a blank one.
pub const DEFAULT_ROOM: &str = "global";

/// URL prefix under which uploaded chat images are served.
pub const IMAGE_URL_PREFIX: &str = "/api/chat/images/";

/// Normalize a room name, mapping blank or missing names to the default room.
pub fn normalize_room(room: Option<&str>) -> String {
    match room.map(str::trim) {
        Some(r) if !r.is_empty() => r.to_string(),
        _ => DEFAULT_ROOM.to_string(),
    }
}

/// A persisted chat message as exchanged with clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: i64,
    pub room: String,
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub content: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub image_total_bytes: i64,
    pub created_at: i64,
}

impl ChatMessage {
    pub fn has_images(&self) -> bool {
        !self.image_urls.is_empty()
    }
}

/// Events pushed from the server to a connected client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerEvent {
    Init { messages: Vec<ChatMessage> },
    Message { message: ChatMessage },
    Error { message: String },
}

/// Frames a client may send over the socket.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ClientCommand {
    Send(SendMessage),
}

/// Body of a send request, shared by the socket and the HTTP endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SendMessage {
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

/// Response returned after a successful image upload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub url: String,
    pub size: i64,
}
