use crate::error::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open a connection pool and run migrations.
///
/// `None` opens a private in-memory database. Every pooled connection to
/// `:memory:` would see its own empty database, so that pool holds a single
/// connection.
pub fn open_pool(path: Option<&Path>) -> Result<DbPool> {
    let pool = match path {
        Some(p) => {
            let manager = SqliteConnectionManager::file(p).with_init(|c| {
                c.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
                c.busy_timeout(Duration::from_secs(5))
            });
            Pool::builder().max_size(8).build(manager)?
        }
        None => Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?,
    };
    pool.get()?.execute_batch(SCHEMA)?;
    Ok(pool)
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chat_messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  room TEXT NOT NULL DEFAULT 'global',
  user_id INTEGER NOT NULL,
  username TEXT NOT NULL,
  display_name TEXT NOT NULL,
  content TEXT NOT NULL,
  image_urls TEXT NOT NULL DEFAULT '[]',
  image_total_bytes INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_room_id ON chat_messages(room, id);
CREATE INDEX IF NOT EXISTS idx_chat_images ON chat_messages(id) WHERE image_total_bytes > 0;
"#;
