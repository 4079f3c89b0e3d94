use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flashnotes::db::{BufferMeta, BufferSummary, Direction, SearchResult, Store};
use flashnotes::error::FlashError;
use flashnotes::session::{BufferStore, SessionConfig, SessionHandle, SessionSnapshot, SessionState};

/// Store wrapper that can fail or slow down saves and reorders on demand.
struct FlakyStore {
    inner: Store,
    fail_saves: AtomicU32,
    fail_reorder: AtomicBool,
    save_delay_ms: AtomicU64,
    saves: AtomicU32,
    in_progress: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: Store) -> Self {
        Self {
            inner,
            fail_saves: AtomicU32::new(0),
            fail_reorder: AtomicBool::new(false),
            save_delay_ms: AtomicU64::new(0),
            saves: AtomicU32::new(0),
            in_progress: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }
}

impl BufferStore for FlakyStore {
    fn create(&self, initial_content: Option<&str>) -> Result<BufferSummary, FlashError> {
        self.inner.create(initial_content)
    }

    fn save(&self, id: &str, content: &str) -> Result<BufferMeta, FlashError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let running = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);

        let delay = self.save_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let result = if self
            .fail_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(FlashError::Busy("injected failure".into()))
        } else {
            self.inner.save(id, content)
        };

        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn open_buffer(&self, id: &str) -> Result<String, FlashError> {
        self.inner.open_buffer(id)
    }

    fn list_page(&self, offset: usize, limit: usize) -> Result<Vec<BufferSummary>, FlashError> {
        self.inner.list_page(offset, limit)
    }

    fn delete(&self, id: &str) -> Result<Option<String>, FlashError> {
        self.inner.delete(id)
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, FlashError> {
        self.inner.search(query, limit)
    }

    fn toggle_pin(&self, id: &str) -> Result<bool, FlashError> {
        self.inner.toggle_pin(id)
    }

    fn reorder(&self, ids: &[String]) -> Result<(), FlashError> {
        if self.fail_reorder.load(Ordering::SeqCst) {
            return Err(FlashError::Busy("injected reorder failure".into()));
        }
        self.inner.reorder(ids)
    }

    fn move_buffer(&self, id: &str, direction: Direction) -> Result<bool, FlashError> {
        self.inner.move_buffer(id, direction)
    }

    fn cleanup_empty(&self, exclude: Option<&str>) -> Result<Vec<String>, FlashError> {
        self.inner.cleanup_empty(exclude)
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        debounce: Duration::from_millis(20),
        max_save_attempts: 3,
        retry_backoff: Duration::from_millis(10),
        flush_timeout: Duration::from_secs(2),
        page_size: 100,
        cleanup_on_start: true,
    }
}

/// File-backed store so saves on the blocking pool and sidebar reads can
/// overlap freely under WAL.
fn setup_store() -> (tempfile::TempDir, Arc<FlakyStore>) {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("flashnotes.db");
    let store = Store::open(&path.to_string_lossy()).unwrap();
    (tmp, Arc::new(FlakyStore::new(store)))
}

async fn start(store: &Arc<FlakyStore>, config: SessionConfig) -> SessionHandle {
    let session = SessionHandle::spawn(store.clone(), config);
    session.start().await.unwrap();
    session
}

async fn wait_for(session: &SessionHandle, pred: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
    for _ in 0..300 {
        let snap = session.snapshot().await.unwrap();
        if pred(&snap) {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reached expected state: {:?}", session.snapshot().await.unwrap());
}

fn sidebar_ids(snap: &SessionSnapshot) -> Vec<String> {
    snap.sidebar.iter().map(|b| b.id.clone()).collect()
}

#[tokio::test]
async fn debounced_edit_persists() {
    let (_tmp, store) = setup_store();
    let session = start(&store, fast_config()).await;

    let b = session.create().await.unwrap();
    session.edit("hello\nworld").await.unwrap();
    let snap = wait_for(&session, |s| !s.dirty && s.state == SessionState::Viewing).await;

    assert_eq!(store.inner.get_content(&b.id).unwrap(), "hello\nworld");
    assert_eq!(snap.sidebar[0].title, "hello");
    assert_eq!(snap.sidebar[0].preview, "world");
}

#[tokio::test]
async fn rapid_edits_coalesce() {
    let (_tmp, store) = setup_store();
    let config = SessionConfig {
        debounce: Duration::from_millis(200),
        ..fast_config()
    };
    let session = start(&store, config).await;

    let b = session.create().await.unwrap();
    for text in ["h", "he", "hel", "hell", "hello"] {
        session.edit(text).await.unwrap();
    }
    wait_for(&session, |s| !s.dirty && s.state == SessionState::Viewing).await;

    assert_eq!(store.inner.get_content(&b.id).unwrap(), "hello");
    assert!(store.saves.load(Ordering::SeqCst) < 5);
}

#[tokio::test]
async fn switching_flushes_pending_edits() {
    let (_tmp, store) = setup_store();
    let config = SessionConfig {
        debounce: Duration::from_secs(30),
        ..fast_config()
    };
    let session = start(&store, config).await;

    let a = session.create().await.unwrap();
    session.edit("alpha").await.unwrap();
    let b = session.create().await.unwrap();
    assert_eq!(store.inner.get_content(&a.id).unwrap(), "alpha");

    session.edit("beta").await.unwrap();
    assert_eq!(session.select(&a.id).await.unwrap(), "alpha");
    assert_eq!(store.inner.get_content(&b.id).unwrap(), "beta");

    let snap = session.snapshot().await.unwrap();
    assert_eq!(snap.active_id.as_deref(), Some(a.id.as_str()));
    assert!(!snap.dirty);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (_tmp, store) = setup_store();
    let config = SessionConfig {
        debounce: Duration::from_secs(30),
        ..fast_config()
    };
    let session = start(&store, config).await;

    let b = session.create().await.unwrap();
    store.fail_saves.store(2, Ordering::SeqCst);
    session.edit("eventually").await.unwrap();

    assert!(session.blur().await.unwrap());
    assert_eq!(store.inner.get_content(&b.id).unwrap(), "eventually");
    assert_eq!(store.saves.load(Ordering::SeqCst), 3);
    assert_eq!(session.snapshot().await.unwrap().state, SessionState::Viewing);
}

#[tokio::test]
async fn exhausted_retries_keep_content_and_block_switch() {
    let (_tmp, store) = setup_store();
    let session = start(&store, fast_config()).await;

    let other = session.create().await.unwrap();
    let draft = session.create().await.unwrap();
    store.fail_saves.store(100, Ordering::SeqCst);
    session.edit("unsaved draft").await.unwrap();

    let snap = wait_for(&session, |s| s.state == SessionState::SaveFailed).await;
    assert!(snap.last_error.as_deref().unwrap().contains("injected"));
    assert_eq!(snap.active_content.as_deref(), Some("unsaved draft"));
    assert!(snap.dirty);

    let err = session.select(&other.id).await.unwrap_err();
    assert!(matches!(err, FlashError::SaveFailed(_)));
    let snap = session.snapshot().await.unwrap();
    assert_eq!(snap.active_id.as_deref(), Some(draft.id.as_str()));
    assert_eq!(snap.active_content.as_deref(), Some("unsaved draft"));

    store.fail_saves.store(0, Ordering::SeqCst);
    session.retry_save().await.unwrap();
    assert_eq!(store.inner.get_content(&draft.id).unwrap(), "unsaved draft");
    let snap = session.snapshot().await.unwrap();
    assert_eq!(snap.state, SessionState::Viewing);
    assert!(snap.last_error.is_none());
}

#[tokio::test]
async fn missing_buffer_fails_without_retry() {
    let (_tmp, store) = setup_store();
    let session = start(&store, fast_config()).await;

    let b = session.create().await.unwrap();
    store.inner.delete(&b.id).unwrap();
    session.edit("orphan").await.unwrap();

    let snap = wait_for(&session, |s| s.state == SessionState::SaveFailed).await;
    assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    assert_eq!(snap.active_content.as_deref(), Some("orphan"));
}

#[tokio::test]
async fn edits_during_save_queue_one_follow_up() {
    let (_tmp, store) = setup_store();
    let session = start(&store, fast_config()).await;

    let b = session.create().await.unwrap();
    store.save_delay_ms.store(200, Ordering::SeqCst);
    session.edit("one").await.unwrap();
    wait_for(&session, |s| s.state == SessionState::Saving).await;
    session.edit("two").await.unwrap();

    assert!(session.blur().await.unwrap());
    assert_eq!(store.inner.get_content(&b.id).unwrap(), "two");
    assert_eq!(store.saves.load(Ordering::SeqCst), 2);
    assert_eq!(store.max_concurrent.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_sweeps_empty_buffers() {
    let (_tmp, store) = setup_store();
    store.inner.create(None).unwrap();
    store.inner.create(Some("  \n")).unwrap();
    let kept = store.inner.create(Some("content")).unwrap();

    let session = start(&store, fast_config()).await;
    let snap = session.snapshot().await.unwrap();
    assert_eq!(sidebar_ids(&snap), vec![kept.id]);
}

#[tokio::test]
async fn cleanup_spares_active_buffer() {
    let (_tmp, store) = setup_store();
    let session = start(&store, fast_config()).await;

    let active = session.create().await.unwrap();
    let stray = store.inner.create(None).unwrap();

    let removed = session.cleanup_empty().await.unwrap();
    assert_eq!(removed, vec![stray.id]);
    assert_eq!(store.inner.get_content(&active.id).unwrap(), "");
    let snap = session.snapshot().await.unwrap();
    assert_eq!(snap.active_id.as_deref(), Some(active.id.as_str()));
}

#[tokio::test]
async fn deleting_active_opens_neighbour() {
    let (_tmp, store) = setup_store();
    let session = start(&store, fast_config()).await;

    let a = session.create().await.unwrap();
    session.edit("first").await.unwrap();
    let b = session.create().await.unwrap();

    let next = session.delete(&b.id).await.unwrap();
    assert_eq!(next.as_deref(), Some(a.id.as_str()));

    let snap = session.snapshot().await.unwrap();
    assert_eq!(snap.active_id.as_deref(), Some(a.id.as_str()));
    assert_eq!(snap.active_content.as_deref(), Some("first"));
    assert_eq!(sidebar_ids(&snap), vec![a.id.clone()]);

    session.delete(&a.id).await.unwrap();
    let snap = session.snapshot().await.unwrap();
    assert_eq!(snap.state, SessionState::Idle);
    assert!(snap.sidebar.is_empty());
}

#[tokio::test]
async fn failed_reorder_resyncs_sidebar() {
    let (_tmp, store) = setup_store();
    for text in ["a", "b", "c"] {
        store.inner.create(Some(text)).unwrap();
    }
    let session = start(&store, fast_config()).await;
    let before = sidebar_ids(&session.snapshot().await.unwrap());

    store.fail_reorder.store(true, Ordering::SeqCst);
    let mut reversed = before.clone();
    reversed.reverse();
    assert!(session.reorder(reversed).await.is_err());

    let snap = session.snapshot().await.unwrap();
    assert_eq!(sidebar_ids(&snap), before);
}

#[tokio::test]
async fn reorder_applies_locally() {
    let (_tmp, store) = setup_store();
    for text in ["a", "b", "c"] {
        store.inner.create(Some(text)).unwrap();
    }
    let session = start(&store, fast_config()).await;
    let mut ids = sidebar_ids(&session.snapshot().await.unwrap());
    ids.reverse();

    session.reorder(ids.clone()).await.unwrap();
    assert_eq!(sidebar_ids(&session.snapshot().await.unwrap()), ids);
    let stored: Vec<String> = store
        .inner
        .list_page(0, 10)
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(stored, ids);
}

#[tokio::test]
async fn pin_and_move_track_store_order() {
    let (_tmp, store) = setup_store();
    for text in ["a", "b", "c"] {
        store.inner.create(Some(text)).unwrap();
    }
    let session = start(&store, fast_config()).await;
    let ids = sidebar_ids(&session.snapshot().await.unwrap());
    let stored = || -> Vec<String> {
        store.inner.list_page(0, 10).unwrap().into_iter().map(|b| b.id).collect()
    };

    assert!(session.toggle_pin(&ids[2]).await.unwrap());
    assert_eq!(sidebar_ids(&session.snapshot().await.unwrap()), stored());

    session.select(&ids[0]).await.unwrap();
    assert!(session.move_active(Direction::Down).await.unwrap());
    assert_eq!(sidebar_ids(&session.snapshot().await.unwrap()), stored());

    assert!(!session.toggle_pin(&ids[2]).await.unwrap());
    assert_eq!(sidebar_ids(&session.snapshot().await.unwrap()), stored());
}

#[tokio::test]
async fn pinning_follows_insertion_order() {
    let (_tmp, store) = setup_store();
    // created back to back, so they usually share a created_at second
    let older = store.inner.create(Some("older")).unwrap();
    let newer = store.inner.create(Some("newer")).unwrap();
    let session = start(&store, fast_config()).await;

    assert!(session.toggle_pin(&newer.id).await.unwrap());
    assert!(session.toggle_pin(&older.id).await.unwrap());

    let stored: Vec<String> = store.inner.list_page(0, 10).unwrap().into_iter().map(|b| b.id).collect();
    assert_eq!(stored, vec![older.id.clone(), newer.id.clone()]);
    assert_eq!(sidebar_ids(&session.snapshot().await.unwrap()), stored);
}

#[tokio::test]
async fn move_past_loaded_window_then_load_more() {
    let (_tmp, store) = setup_store();
    for text in ["a", "b", "c"] {
        store.inner.create(Some(text)).unwrap();
    }
    let config = SessionConfig {
        page_size: 2,
        ..fast_config()
    };
    let session = start(&store, config).await;
    let loaded = sidebar_ids(&session.snapshot().await.unwrap());
    assert_eq!(loaded.len(), 2);

    // last loaded row swaps with one that was never fetched
    session.select(&loaded[1]).await.unwrap();
    assert!(session.move_active(Direction::Down).await.unwrap());

    let stored = || -> Vec<String> {
        store.inner.list_page(0, 10).unwrap().into_iter().map(|b| b.id).collect()
    };
    assert_eq!(stored()[2], loaded[1]);
    let snap = session.snapshot().await.unwrap();
    assert_eq!(sidebar_ids(&snap), stored()[..2].to_vec());
    assert!(snap.has_more);

    session.load_more().await.unwrap();
    let snap = session.snapshot().await.unwrap();
    assert_eq!(sidebar_ids(&snap), stored());
    assert!(!snap.has_more);
}

#[tokio::test]
async fn load_more_pages_sidebar() {
    let (_tmp, store) = setup_store();
    for i in 0..5 {
        store.inner.create(Some(&format!("note {i}"))).unwrap();
    }
    let config = SessionConfig {
        page_size: 2,
        ..fast_config()
    };
    let session = start(&store, config).await;

    let snap = session.snapshot().await.unwrap();
    assert_eq!(snap.sidebar.len(), 2);
    assert!(snap.has_more);

    assert_eq!(session.load_more().await.unwrap(), 2);
    assert_eq!(session.load_more().await.unwrap(), 1);
    let snap = session.snapshot().await.unwrap();
    assert_eq!(snap.sidebar.len(), 5);
    assert!(!snap.has_more);
}

#[tokio::test]
async fn search_results_are_kept() {
    let (_tmp, store) = setup_store();
    store.inner.create(Some("the zephyr project")).unwrap();
    let session = start(&store, fast_config()).await;

    let results = session.search("zephyr").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(session.snapshot().await.unwrap().search_results.len(), 1);
    assert!(matches!(
        session.search("zephyr*").await,
        Err(FlashError::Validation(_))
    ));
}

#[tokio::test]
async fn edit_requires_active_buffer() {
    let (_tmp, store) = setup_store();
    let session = start(&store, fast_config()).await;
    assert!(matches!(
        session.edit("nowhere").await,
        Err(FlashError::NoActiveBuffer)
    ));
    assert!(!session.move_active(Direction::Up).await.unwrap());
}

#[tokio::test]
async fn shutdown_flushes_and_closes() {
    let (_tmp, store) = setup_store();
    let config = SessionConfig {
        debounce: Duration::from_secs(30),
        ..fast_config()
    };
    let session = start(&store, config).await;

    let b = session.create().await.unwrap();
    session.edit("last words").await.unwrap();
    session.shutdown().await.unwrap();

    assert_eq!(store.inner.get_content(&b.id).unwrap(), "last words");
    assert!(matches!(session.snapshot().await, Err(FlashError::SessionClosed)));
}

#[tokio::test]
async fn blur_timeout_lets_slow_save_land() {
    let (_tmp, store) = setup_store();
    let config = SessionConfig {
        debounce: Duration::from_secs(30),
        flush_timeout: Duration::from_millis(20),
        ..fast_config()
    };
    let session = start(&store, config).await;
    let b = session.create().await.unwrap();

    store.save_delay_ms.store(200, Ordering::SeqCst);
    session.edit("slow words").await.unwrap();
    assert!(!session.blur().await.unwrap());

    let snap = session.snapshot().await.unwrap();
    assert!(snap.dirty);
    assert!(matches!(snap.state, SessionState::Saving | SessionState::SaveFailed));
    assert_eq!(snap.active_content.as_deref(), Some("slow words"));

    let snap = wait_for(&session, |s| s.state == SessionState::Viewing && !s.dirty).await;
    assert!(snap.last_error.is_none());
    assert_eq!(store.inner.get_content(&b.id).unwrap(), "slow words");
    assert_eq!(store.max_concurrent.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blur_timeout_during_backoff_marks_save_failed() {
    let (_tmp, store) = setup_store();
    let config = SessionConfig {
        debounce: Duration::from_secs(30),
        retry_backoff: Duration::from_millis(500),
        flush_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let session = start(&store, config).await;
    let b = session.create().await.unwrap();

    store.fail_saves.store(10, Ordering::SeqCst);
    session.edit("kept anyway").await.unwrap();
    assert!(!session.blur().await.unwrap());

    let snap = session.snapshot().await.unwrap();
    assert_eq!(snap.state, SessionState::SaveFailed);
    assert_eq!(snap.last_error.as_deref(), Some("flush timed out"));
    assert!(snap.dirty);
    assert_eq!(snap.active_content.as_deref(), Some("kept anyway"));

    store.fail_saves.store(0, Ordering::SeqCst);
    session.retry_save().await.unwrap();
    let snap = session.snapshot().await.unwrap();
    assert_eq!(snap.state, SessionState::Viewing);
    assert_eq!(store.inner.get_content(&b.id).unwrap(), "kept anyway");
}
