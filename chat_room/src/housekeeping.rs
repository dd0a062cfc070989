use crate::error::Result;
use crate::room::ChatRoom;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Uploaded files younger than this are never treated as orphans, so an
/// image uploaded just before its message is posted survives.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(3600);

/// What a single housekeeping pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub trimmed: usize,
    pub evicted: usize,
    pub orphans: usize,
    pub released_hubs: usize,
}

/// Run one pass: per-room retention, the image budget, the orphan sweep and
/// idle hub release. A failing step is logged and the remaining steps still
/// run; only failing to list the rooms aborts the pass.
pub fn run_once(chat: &ChatRoom, orphan_grace: Duration) -> Result<Report> {
    let mut report = Report::default();
    for room in chat.store().rooms()? {
        match chat.trim_room(&room) {
            Ok(n) => report.trimmed += n,
            Err(e) => warn!(room = %room, error = %e, "retention sweep failed"),
        }
    }
    match chat.enforce_image_budget() {
        Ok(n) => report.evicted = n,
        Err(e) => warn!(error = %e, "image budget enforcement failed"),
    }
    match chat.images().sweep_orphans(orphan_grace) {
        Ok(n) => report.orphans = n,
        Err(e) => warn!(error = %e, "orphan sweep failed"),
    }
    report.released_hubs = chat.release_idle_hubs();
    Ok(report)
}

/// Periodically run housekeeping in the background.
pub fn spawn(chat: ChatRoom) -> JoinHandle<()> {
    let period = Duration::from_secs(chat.settings().housekeeping_interval_secs);
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let pass = chat.clone();
            match tokio::task::spawn_blocking(move || run_once(&pass, ORPHAN_GRACE)).await {
                Ok(Ok(report)) if report != Report::default() => {
                    info!(
                        trimmed = report.trimmed,
                        evicted = report.evicted,
                        orphans = report.orphans,
                        released_hubs = report.released_hubs,
                        "housekeeping pass"
                    );
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "housekeeping failed"),
                Err(e) => warn!(error = %e, "housekeeping task panicked"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{tests::text, NewMessage};
    use crate::room::tests::{alice, room_with};

    #[test]
    fn pass_trims_every_room_and_enforces_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let chat = room_with(tmp.path(), |s| {
            s.message_limit = 1;
            s.image_cache_max_bytes = 50;
        });
        for room in ["a", "a", "b", "b", "b"] {
            chat.store().insert(text(room, "hi")).unwrap();
        }
        for (name, size) in [("gone-1.png", 40), ("gone-2.png", 40)] {
            chat.store()
                .insert(NewMessage {
                    image_urls: vec![format!("/api/chat/images/20260101/{name}")],
                    image_total_bytes: size,
                    ..text("c", "")
                })
                .unwrap();
        }
        let report = run_once(&chat, ORPHAN_GRACE).unwrap();
        assert_eq!(report.trimmed, 1 + 2 + 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(report.orphans, 0);
        for room in ["a", "b", "c"] {
            assert_eq!(chat.store().list(room, 10, 0).unwrap().len(), 1);
        }
    }

    #[test]
    fn empty_store_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let chat = room_with(tmp.path(), |_| {});
        assert_eq!(run_once(&chat, ORPHAN_GRACE).unwrap(), Report::default());
    }

    #[test]
    fn budget_failure_does_not_skip_the_rest() {
        let tmp = tempfile::tempdir().unwrap();
        let chat = room_with(tmp.path(), |s| {
            s.message_limit = 1;
            s.image_cache_max_bytes = 0;
        });
        chat.store().insert(text("a", "one")).unwrap();
        chat.store().insert(text("a", "two")).unwrap();
        let dir = chat.images().root().join("20260101");
        std::fs::create_dir_all(&dir).unwrap();
        let orphan = dir.join("left.png");
        std::fs::write(&orphan, b"x").unwrap();

        let report = run_once(&chat, Duration::ZERO).unwrap();
        assert_eq!(report.trimmed, 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(report.orphans, 1);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn pass_releases_idle_hubs() {
        let tmp = tempfile::tempdir().unwrap();
        let chat = room_with(tmp.path(), |_| {});
        let sub = chat.subscribe(Some("lobby"), &alice()).await.unwrap();
        assert_eq!(run_once(&chat, ORPHAN_GRACE).unwrap().released_hubs, 0);
        drop(sub);
        assert_eq!(run_once(&chat, ORPHAN_GRACE).unwrap().released_hubs, 1);
        assert_eq!(chat.active_rooms(), 0);
    }
}
