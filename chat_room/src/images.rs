use crate::error::{ChatError, Result};
use crate::messages::{row_to_msg, MessageStore};
use bytes::Bytes;
use room_api::{ChatMessage, UploadedImage, IMAGE_URL_PREFIX};
use rusqlite::OptionalExtension;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Upper bound on evictions performed by a single budget pass.
pub const MAX_EVICTIONS_PER_PASS: usize = 10_000;

const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "gif", "webp"];

/// Keeps the bytes of image attachments across all rooms under a budget and
/// owns the image files on disk.
#[derive(Clone)]
pub struct ImageCache {
    store: MessageStore,
    root: PathBuf,
}

impl ImageCache {
    pub fn new(store: MessageStore, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sum of attached image bytes over every stored message.
    pub fn total_bytes(&self) -> Result<i64> {
        let conn = self.store.pool().get()?;
        let total = conn.query_row(
            "SELECT COALESCE(SUM(image_total_bytes), 0) FROM chat_messages",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Evict the oldest image-bearing messages until the total fits `max_bytes`.
    ///
    /// The total is recomputed on every round so concurrent inserts are taken
    /// into account. Returns the number of messages this call evicted.
    pub fn enforce_budget(&self, max_bytes: i64) -> Result<usize> {
        if max_bytes <= 0 {
            return Err(ChatError::InvalidBudget(max_bytes));
        }
        let mut evicted = 0;
        for _ in 0..MAX_EVICTIONS_PER_PASS {
            let total = self.total_bytes()?;
            if total <= max_bytes {
                if evicted > 0 {
                    info!(evicted, total, max_bytes, "image cache trimmed");
                }
                return Ok(evicted);
            }
            let oldest = {
                let conn = self.store.pool().get()?;
                conn.query_row(
                    "SELECT id, room, user_id, username, display_name, content, image_urls, image_total_bytes, created_at FROM chat_messages WHERE image_total_bytes > 0 ORDER BY id ASC LIMIT 1",
                    [],
                    row_to_msg,
                )
                .optional()?
            };
            let Some(oldest) = oldest else {
                warn!(total, max_bytes, "image total over budget with nothing left to evict");
                return Ok(evicted);
            };
            if self.evict(&oldest)? {
                evicted += 1;
            }
        }
        warn!(evicted, max_bytes, "image eviction cap reached, deferring to next pass");
        Ok(evicted)
    }

    /// Delete one message row and then its images. Returns `false` when the
    /// row was already gone, in which case its files are left to whoever
    /// removed it.
    fn evict(&self, msg: &ChatMessage) -> Result<bool> {
        let removed = {
            let conn = self.store.pool().get()?;
            conn.execute("DELETE FROM chat_messages WHERE id = ?1", [msg.id])?
        };
        if removed == 0 {
            return Ok(false);
        }
        self.delete_message_images(std::slice::from_ref(msg));
        Ok(true)
    }

    /// Remove the image files of already-deleted messages. Only managed URLs
    /// that resolve inside the image root and that no remaining message
    /// references are touched. Returns the number of files removed.
    pub fn delete_message_images(&self, messages: &[ChatMessage]) -> usize {
        let mut removed = 0;
        for url in messages.iter().flat_map(|m| m.image_urls.iter()) {
            let Some(path) = self.resolve_url(url) else {
                debug!(url = %url, "skipping unmanaged image reference");
                continue;
            };
            match self.store.image_in_use(url) {
                Ok(false) => {}
                Ok(true) => {
                    debug!(url = %url, "image still referenced, keeping file");
                    continue;
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "image reference check failed, keeping file");
                    continue;
                }
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => debug!(path = %path.display(), error = %e, "image removal failed"),
            }
        }
        removed
    }

    /// The canonical form of a managed image URL, with `.` and inner `..`
    /// segments resolved, or `None` when it is not a managed image.
    pub fn canonical_url(&self, url: &str) -> Option<String> {
        let path = self.resolve_url(url)?;
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(format!("{IMAGE_URL_PREFIX}{}", parts.join("/")))
    }

    /// Map a served image URL to its file, or `None` when the URL is not a
    /// managed image or would escape the image root.
    pub fn resolve_url(&self, url: &str) -> Option<PathBuf> {
        let rel = url.strip_prefix(IMAGE_URL_PREFIX)?;
        let mut parts = Vec::new();
        for comp in Path::new(rel).components() {
            match comp {
                Component::Normal(p) => parts.push(p),
                Component::CurDir => {}
                Component::ParentDir => {
                    parts.pop()?;
                }
                Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        let mut path = self.root.clone();
        path.extend(parts);
        path.starts_with(&self.root).then_some(path)
    }

    /// Total on-disk size of the referenced images; every URL must name an
    /// existing managed file.
    pub fn measure(&self, urls: &[String]) -> Result<i64> {
        let mut total = 0i64;
        for url in urls {
            let path = self
                .resolve_url(url)
                .ok_or_else(|| ChatError::InvalidImage(url.clone()))?;
            let meta = std::fs::metadata(&path).map_err(|_| ChatError::InvalidImage(url.clone()))?;
            if !meta.is_file() {
                return Err(ChatError::InvalidImage(url.clone()));
            }
            total += meta.len() as i64;
        }
        Ok(total)
    }

    /// Store an uploaded image under a per-day directory and return its URL.
    pub async fn save(&self, data: Bytes, max_bytes: i64) -> Result<UploadedImage> {
        if data.len() as i64 > max_bytes {
            return Err(ChatError::ImageTooLarge { max: max_bytes });
        }
        let ext = infer::get(&data)
            .filter(|k| k.matcher_type() == infer::MatcherType::Image)
            .map(|k| k.extension())
            .filter(|ext| ALLOWED_EXTENSIONS.contains(ext))
            .ok_or(ChatError::UnsupportedImage)?;
        let day = day_dir(OffsetDateTime::now_utc());
        let dir = self.root.join(&day);
        fs::create_dir_all(&dir).await?;
        let name = format!("{}.{}", Uuid::new_v4(), ext);
        let size = data.len() as i64;
        fs::write(dir.join(&name), data).await?;
        Ok(UploadedImage {
            url: format!("{IMAGE_URL_PREFIX}{day}/{name}"),
            size,
        })
    }

    /// Delete files under the image root that no stored message references
    /// and that are older than `grace`. Returns the number of files removed.
    pub fn sweep_orphans(&self, grace: Duration) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let keep: HashSet<PathBuf> = self
            .store
            .referenced_image_urls()?
            .iter()
            .filter_map(|u| self.resolve_url(u))
            .collect();
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in WalkDir::new(&self.root).min_depth(1).into_iter().flatten() {
            if !entry.file_type().is_file() || keep.contains(entry.path()) {
                continue;
            }
            let old_enough = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| now.duration_since(t).ok())
                .is_some_and(|age| age >= grace);
            if old_enough && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn day_dir(now: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::messages::{tests::text, NewMessage};

    struct Fixture {
        tmp: tempfile::TempDir,
        store: MessageStore,
        cache: ImageCache,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = MessageStore::new(db::open_pool(None).unwrap());
        let cache = ImageCache::new(store.clone(), tmp.path().join("images"));
        Fixture {
            tmp,
            store,
            cache,
        }
    }

    fn put_image(cache: &ImageCache, name: &str, size: usize) -> (String, PathBuf) {
        let dir = cache.root().join("20260101");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; size]).unwrap();
        (format!("{IMAGE_URL_PREFIX}20260101/{name}"), path)
    }

    fn image_msg(url: String, size: i64) -> NewMessage {
        let mut m = text("global", "");
        m.image_urls = vec![url];
        m.image_total_bytes = size;
        m
    }

    #[test]
    fn budget_evicts_oldest_first() {
        let f = fixture();
        let mut paths = Vec::new();
        for (name, size) in [("a.png", 500), ("b.png", 300), ("c.png", 200)] {
            let (url, path) = put_image(&f.cache, name, size);
            f.store.insert(image_msg(url, size as i64)).unwrap();
            paths.push(path);
        }
        f.store.insert(text("global", "plain text")).unwrap();
        assert_eq!(f.cache.total_bytes().unwrap(), 1000);

        assert_eq!(f.cache.enforce_budget(600).unwrap(), 2);
        assert_eq!(f.cache.total_bytes().unwrap(), 200);
        assert!(!paths[0].exists());
        assert!(!paths[1].exists());
        assert!(paths[2].exists());
        let left: Vec<i64> = f.store.list("global", 10, 0).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(left, vec![3, 4]);

        assert_eq!(f.cache.enforce_budget(600).unwrap(), 0);
        assert!(paths[2].exists());
    }

    #[test]
    fn budget_rejects_non_positive() {
        let f = fixture();
        assert!(matches!(
            f.cache.enforce_budget(0),
            Err(ChatError::InvalidBudget(0))
        ));
    }

    #[test]
    fn eviction_proceeds_when_file_is_missing() {
        let f = fixture();
        let url = format!("{IMAGE_URL_PREFIX}20260101/gone.png");
        f.store.insert(image_msg(url, 50)).unwrap();
        assert_eq!(f.cache.enforce_budget(10).unwrap(), 1);
        assert_eq!(f.cache.total_bytes().unwrap(), 0);
    }

    #[test]
    fn traversal_urls_are_never_deleted() {
        let f = fixture();
        let outside = f.tmp.path().join("secret.txt");
        std::fs::write(&outside, b"keep me").unwrap();
        let evil = format!("{IMAGE_URL_PREFIX}../secret.txt");
        assert!(f.cache.resolve_url(&evil).is_none());
        assert!(f
            .cache
            .resolve_url(&format!("{IMAGE_URL_PREFIX}20260101/../../secret.txt"))
            .is_none());
        assert!(f.cache.resolve_url("/elsewhere/secret.txt").is_none());
        assert!(f
            .cache
            .resolve_url(&format!("{IMAGE_URL_PREFIX}/etc/passwd"))
            .is_none());

        f.store.insert(image_msg(evil, 100)).unwrap();
        assert_eq!(f.cache.enforce_budget(1).unwrap(), 1);
        assert!(outside.exists());
    }

    #[test]
    fn resolve_allows_inner_dotdot() {
        let f = fixture();
        let p = f
            .cache
            .resolve_url(&format!("{IMAGE_URL_PREFIX}20260101/../20260102/a.png"))
            .unwrap();
        assert_eq!(p, f.cache.root().join("20260102").join("a.png"));
    }

    #[test]
    fn measure_requires_existing_managed_files() {
        let f = fixture();
        let (url, _) = put_image(&f.cache, "m.png", 42);
        assert_eq!(f.cache.measure(&[url.clone(), url]).unwrap(), 84);
        let missing = format!("{IMAGE_URL_PREFIX}20260101/none.png");
        assert!(matches!(
            f.cache.measure(&[missing]),
            Err(ChatError::InvalidImage(_))
        ));
        assert!(f.cache.measure(&["https://example.com/x.png".into()]).is_err());
    }

    #[tokio::test]
    async fn save_sniffs_and_limits() {
        let f = fixture();
        let png = Bytes::from_static(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR");
        let saved = f.cache.save(png.clone(), 1024).await.unwrap();
        assert!(saved.url.starts_with(IMAGE_URL_PREFIX));
        assert!(saved.url.ends_with(".png"));
        assert_eq!(f.cache.measure(&[saved.url]).unwrap(), png.len() as i64);

        assert!(matches!(
            f.cache.save(png, 4).await,
            Err(ChatError::ImageTooLarge { max: 4 })
        ));
        assert!(matches!(
            f.cache.save(Bytes::from_static(b"plain text"), 1024).await,
            Err(ChatError::UnsupportedImage)
        ));
    }

    #[test]
    fn sweep_removes_only_unreferenced() {
        let f = fixture();
        let (kept_url, kept) = put_image(&f.cache, "kept.png", 10);
        let (_, orphan) = put_image(&f.cache, "orphan.png", 10);
        f.store.insert(image_msg(kept_url, 10)).unwrap();
        assert_eq!(f.cache.sweep_orphans(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(f.cache.sweep_orphans(Duration::ZERO).unwrap(), 1);
        assert!(kept.exists());
        assert!(!orphan.exists());
    }

    #[test]
    fn shared_file_outlives_one_of_its_messages() {
        let f = fixture();
        let (url, path) = put_image(&f.cache, "shared.png", 100);
        let first = f.store.insert(image_msg(url.clone(), 100)).unwrap();
        let conn = f.store.pool().get().unwrap();
        conn.execute(
            "INSERT INTO chat_messages (room, user_id, username, display_name, content, image_urls, image_total_bytes, created_at) SELECT room, user_id, username, display_name, 'copy', image_urls, image_total_bytes, created_at FROM chat_messages WHERE id = ?1",
            [first.id],
        )
        .unwrap();
        drop(conn);

        assert_eq!(f.cache.enforce_budget(150).unwrap(), 1);
        assert!(path.exists());
        assert!(f.store.image_in_use(&url).unwrap());

        assert_eq!(f.cache.enforce_budget(50).unwrap(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn evicting_a_removed_row_is_not_counted() {
        let f = fixture();
        let (url, path) = put_image(&f.cache, "once.png", 10);
        let msg = f.store.insert(image_msg(url, 10)).unwrap();
        assert!(f.cache.evict(&msg).unwrap());
        assert!(!path.exists());
        std::fs::write(&path, b"replaced").unwrap();
        assert!(!f.cache.evict(&msg).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn canonical_url_resolves_dot_segments() {
        let f = fixture();
        assert_eq!(
            f.cache
                .canonical_url(&format!("{IMAGE_URL_PREFIX}20260101/./../20260102/a.png"))
                .unwrap(),
            format!("{IMAGE_URL_PREFIX}20260102/a.png")
        );
        assert!(f
            .cache
            .canonical_url(&format!("{IMAGE_URL_PREFIX}../a.png"))
            .is_none());
    }
}
