use crate::db::DbPool;
use crate::error::{ChatError, Result};
use room_api::{normalize_room, ChatMessage};
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use time::OffsetDateTime;
use tracing::warn;

/// Page size used when a caller passes no usable limit.
pub const DEFAULT_LIST_LIMIT: i64 = 100;
/// Hard cap on a single history page.
pub const MAX_LIST_LIMIT: i64 = 5000;
/// Width of the room column.
pub const MAX_ROOM_LEN: usize = 64;

const COLUMNS: &str =
    "id, room, user_id, username, display_name, content, image_urls, image_total_bytes, created_at";

/// A validated message waiting to be persisted. Author identity is trusted as given.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub room: Option<String>,
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub content: String,
    pub image_urls: Vec<String>,
    pub image_total_bytes: i64,
}

/// Persistence for chat messages, partitioned by room.
#[derive(Clone)]
pub struct MessageStore {
    pool: DbPool,
}

impl MessageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Persist a message, assigning its id and timestamp.
    ///
    /// An image file belongs to exactly one message, so an image URL already
    /// attached to a stored message is rejected.
    pub fn insert(&self, msg: NewMessage) -> Result<ChatMessage> {
        if msg.content.trim().is_empty() && msg.image_urls.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let room = checked_room(msg.room.as_deref())?;
        let urls = serde_json::to_string(&msg.image_urls)?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for url in &msg.image_urls {
            if url_referenced(&tx, url)? {
                return Err(ChatError::ImageInUse(url.clone()));
            }
        }
        tx.execute(
            "INSERT INTO chat_messages (room, user_id, username, display_name, content, image_urls, image_total_bytes, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                room,
                msg.user_id,
                msg.username,
                msg.display_name,
                msg.content,
                urls,
                msg.image_total_bytes,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(ChatMessage {
            id,
            room,
            user_id: msg.user_id,
            username: msg.username,
            display_name: msg.display_name,
            content: msg.content,
            image_urls: msg.image_urls,
            image_total_bytes: msg.image_total_bytes,
            created_at: now,
        })
    }

    /// Whether any stored message still references `url`.
    pub fn image_in_use(&self, url: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        url_referenced(&conn, url)
    }

    /// List messages of a room in chronological order.
    ///
    /// `before_id > 0` restricts the page to ids strictly below it, so paging
    /// stays stable while new messages arrive.
    pub fn list(&self, room: &str, limit: i64, before_id: i64) -> Result<Vec<ChatMessage>> {
        let room = normalize_room(Some(room));
        let limit = if limit <= 0 {
            DEFAULT_LIST_LIMIT
        } else {
            limit.min(MAX_LIST_LIMIT)
        };
        let conn = self.pool.get()?;
        let mut msgs = if before_id > 0 {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM chat_messages WHERE room = ?1 AND id < ?2 ORDER BY id DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![room, before_id, limit], row_to_msg)?;
            rows.collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM chat_messages WHERE room = ?1 ORDER BY id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![room, limit], row_to_msg)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        msgs.reverse();
        Ok(msgs)
    }

    /// Delete the oldest messages of a room beyond `keep` and return them so
    /// their images can be released. `keep <= 0` never deletes anything.
    pub fn trim(&self, room: &str, keep: i64) -> Result<Vec<ChatMessage>> {
        if keep <= 0 {
            return Ok(Vec::new());
        }
        let room = normalize_room(Some(room));
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE room = ?1",
            [&room],
            |row| row.get(0),
        )?;
        if count <= keep {
            return Ok(Vec::new());
        }
        let doomed = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {COLUMNS} FROM chat_messages WHERE room = ?1 ORDER BY id ASC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![room, count - keep], row_to_msg)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        delete_ids(&tx, doomed.iter().map(|m| m.id))?;
        tx.commit()?;
        Ok(doomed)
    }

    /// Rooms that currently hold at least one message.
    pub fn rooms(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT DISTINCT room FROM chat_messages ORDER BY room")?;
        let rooms = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rooms)
    }

    /// Every image URL referenced by a stored message.
    pub fn referenced_image_urls(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT id, image_urls FROM chat_messages WHERE image_urls <> '[]'")?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut urls = Vec::new();
        for (id, r) in raw {
            urls.extend(decode_urls(id, &r));
        }
        Ok(urls)
    }
}

/// Normalize a room name and check it fits the storage column.
pub fn checked_room(room: Option<&str>) -> Result<String> {
    let room = normalize_room(room);
    if room.chars().count() > MAX_ROOM_LEN {
        return Err(ChatError::RoomNameTooLong { max: MAX_ROOM_LEN });
    }
    Ok(room)
}

pub(crate) fn delete_ids(conn: &Connection, ids: impl Iterator<Item = i64>) -> Result<usize> {
    let ids: Vec<i64> = ids.collect();
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let n = conn.execute(
        &format!("DELETE FROM chat_messages WHERE id IN ({placeholders})"),
        params_from_iter(ids.iter()),
    )?;
    Ok(n)
}

fn url_referenced(conn: &Connection, url: &str) -> Result<bool> {
    // Elements of the JSON array are quoted, so the quoted URL only matches
    // a whole element.
    let needle = serde_json::to_string(url)?;
    let found = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM chat_messages WHERE instr(image_urls, ?1) > 0)",
        [needle],
        |row| row.get(0),
    )?;
    Ok(found)
}

fn decode_urls(id: i64, raw: &str) -> Vec<String> {
    match serde_json::from_str(raw) {
        Ok(urls) => urls,
        Err(e) => {
            warn!(id, error = %e, "unreadable image_urls column, treating as empty");
            Vec::new()
        }
    }
}

pub(crate) fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id: i64 = row.get(0)?;
    let urls: String = row.get(6)?;
    Ok(ChatMessage {
        id,
        room: row.get(1)?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        display_name: row.get(4)?,
        content: row.get(5)?,
        image_urls: decode_urls(id, &urls),
        image_total_bytes: row.get(7)?,
        created_at: row.get(8)?,
    })
}
