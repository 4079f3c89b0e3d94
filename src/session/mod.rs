//! Client-side editing session: the active buffer, the sidebar view and the
//! save pipeline that keeps them durable.
//!
//! All state lives in one actor task. Callers hold a cheap, cloneable
//! [`SessionHandle`] and talk to it over a bounded channel; every request
//! gets its answer on a oneshot. Storage calls run on the blocking pool, so
//! the actor never waits on disk except where a flush is explicitly awaited.

mod actor;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::db::{BufferMeta, BufferSummary, Direction, SearchResult, Store};
use crate::error::FlashError;

/// Storage operations the session depends on. [`Store`] is the real one;
/// tests wrap it to inject failures.
pub trait BufferStore: Send + Sync + 'static {
    fn create(&self, initial_content: Option<&str>) -> Result<BufferSummary, FlashError>;
    fn save(&self, id: &str, content: &str) -> Result<BufferMeta, FlashError>;
    fn open_buffer(&self, id: &str) -> Result<String, FlashError>;
    fn list_page(&self, offset: usize, limit: usize) -> Result<Vec<BufferSummary>, FlashError>;
    fn delete(&self, id: &str) -> Result<Option<String>, FlashError>;
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, FlashError>;
    fn toggle_pin(&self, id: &str) -> Result<bool, FlashError>;
    fn reorder(&self, ids: &[String]) -> Result<(), FlashError>;
    fn move_buffer(&self, id: &str, direction: Direction) -> Result<bool, FlashError>;
    fn cleanup_empty(&self, exclude: Option<&str>) -> Result<Vec<String>, FlashError>;
}

impl BufferStore for Store {
    fn create(&self, initial_content: Option<&str>) -> Result<BufferSummary, FlashError> {
        Store::create(self, initial_content)
    }
    fn save(&self, id: &str, content: &str) -> Result<BufferMeta, FlashError> {
        Store::save(self, id, content)
    }
    fn open_buffer(&self, id: &str) -> Result<String, FlashError> {
        Store::open_buffer(self, id)
    }
    fn list_page(&self, offset: usize, limit: usize) -> Result<Vec<BufferSummary>, FlashError> {
        Store::list_page(self, offset, limit)
    }
    fn delete(&self, id: &str) -> Result<Option<String>, FlashError> {
        Store::delete(self, id)
    }
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, FlashError> {
        Store::search(self, query, limit)
    }
    fn toggle_pin(&self, id: &str) -> Result<bool, FlashError> {
        Store::toggle_pin(self, id)
    }
    fn reorder(&self, ids: &[String]) -> Result<(), FlashError> {
        Store::reorder(self, ids)
    }
    fn move_buffer(&self, id: &str, direction: Direction) -> Result<bool, FlashError> {
        Store::move_buffer(self, id, direction)
    }
    fn cleanup_empty(&self, exclude: Option<&str>) -> Result<Vec<String>, FlashError> {
        Store::cleanup_empty(self, exclude)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period after the last edit before a save is dispatched.
    pub debounce: Duration,
    pub max_save_attempts: u32,
    /// Multiplied by the attempt number between retries.
    pub retry_backoff: Duration,
    /// Upper bound on a blur flush.
    pub flush_timeout: Duration,
    pub page_size: usize,
    pub cleanup_on_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            max_save_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            flush_timeout: Duration::from_secs(2),
            page_size: crate::db::DEFAULT_PAGE_SIZE,
            cleanup_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No active buffer.
    Idle,
    /// Active buffer, nothing pending.
    Viewing,
    /// Unsaved edits waiting for the debounce or a retry.
    Editing,
    /// A save is in flight.
    Saving,
    /// Retries exhausted. Content is kept until a retry or a new edit.
    SaveFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub active_id: Option<String>,
    pub active_content: Option<String>,
    pub dirty: bool,
    pub sidebar: Vec<BufferSummary>,
    pub has_more: bool,
    pub search_results: Vec<SearchResult>,
    pub last_error: Option<String>,
}

type Reply<T> = oneshot::Sender<Result<T, FlashError>>;

enum Command {
    Start(Reply<()>),
    Create(Reply<BufferSummary>),
    Select(String, Reply<String>),
    Edit(String, Reply<()>),
    Delete(String, Reply<Option<String>>),
    TogglePin(String, Reply<bool>),
    Reorder(Vec<String>, Reply<()>),
    MoveActive(Direction, Reply<bool>),
    Search(String, Reply<Vec<SearchResult>>),
    LoadMore(Reply<usize>),
    CleanupEmpty(Reply<Vec<String>>),
    RetrySave(Reply<()>),
    Blur(Reply<bool>),
    Snapshot(Reply<SessionSnapshot>),
    Shutdown(Reply<()>),
}

const COMMAND_QUEUE: usize = 64;

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Spawn the session actor on the current runtime.
    pub fn spawn(store: Arc<dyn BufferStore>, config: SessionConfig) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(actor::Actor::new(store, config).run(rx));
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, FlashError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| FlashError::SessionClosed)?;
        rx.await.map_err(|_| FlashError::SessionClosed)?
    }

    /// Sweep empty buffers (if configured) and load the first sidebar page.
    pub async fn start(&self) -> Result<(), FlashError> {
        self.request(Command::Start).await
    }

    /// Flush, create an empty buffer and make it active.
    pub async fn create(&self) -> Result<BufferSummary, FlashError> {
        self.request(Command::Create).await
    }

    /// Switch the active buffer, returning its content. Refused with
    /// `SaveFailed` if the current buffer can't be flushed first.
    pub async fn select(&self, id: &str) -> Result<String, FlashError> {
        let id = id.to_string();
        self.request(|r| Command::Select(id, r)).await
    }

    /// Replace the active buffer's content and (re)arm the debounce.
    pub async fn edit(&self, content: impl Into<String>) -> Result<(), FlashError> {
        let content = content.into();
        self.request(|r| Command::Edit(content, r)).await
    }

    pub async fn delete(&self, id: &str) -> Result<Option<String>, FlashError> {
        let id = id.to_string();
        self.request(|r| Command::Delete(id, r)).await
    }

    pub async fn toggle_pin(&self, id: &str) -> Result<bool, FlashError> {
        let id = id.to_string();
        self.request(|r| Command::TogglePin(id, r)).await
    }

    pub async fn reorder(&self, ids: Vec<String>) -> Result<(), FlashError> {
        self.request(|r| Command::Reorder(ids, r)).await
    }

    /// Move the active buffer one slot. False when it can't move.
    pub async fn move_active(&self, direction: Direction) -> Result<bool, FlashError> {
        self.request(|r| Command::MoveActive(direction, r)).await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>, FlashError> {
        let query = query.to_string();
        self.request(|r| Command::Search(query, r)).await
    }

    /// Append the next sidebar page. Returns how many rows arrived.
    pub async fn load_more(&self) -> Result<usize, FlashError> {
        self.request(Command::LoadMore).await
    }

    /// Remove empty buffers other than the active one.
    pub async fn cleanup_empty(&self) -> Result<Vec<String>, FlashError> {
        self.request(Command::CleanupEmpty).await
    }

    pub async fn retry_save(&self) -> Result<(), FlashError> {
        self.request(Command::RetrySave).await
    }

    /// Bounded flush for focus loss. True when everything is on disk.
    pub async fn blur(&self) -> Result<bool, FlashError> {
        self.request(Command::Blur).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, FlashError> {
        self.request(Command::Snapshot).await
    }

    /// Blur, then stop the actor. Later calls fail with `SessionClosed`.
    pub async fn shutdown(&self) -> Result<(), FlashError> {
        self.request(Command::Shutdown).await
    }
}
