//! The session actor: owns the active buffer, the sidebar and the save
//! pipeline.
//!
//! Saves run as spawned tasks and report back over `done_rx`. At most one is
//! ever in flight. Edits that arrive meanwhile set `resave_queued`, and the
//! completion handler dispatches the follow-up.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{BufferStore, Command, SessionConfig, SessionSnapshot, SessionState};
use crate::db::{merge_order, BufferMeta, BufferSummary, Direction, DEFAULT_SEARCH_LIMIT};
use crate::error::FlashError;
use crate::util::now_secs;

struct ActiveBuffer {
    id: String,
    content: String,
    /// Bumped on every edit.
    generation: u64,
    /// Newest generation known to be on disk.
    saved_generation: u64,
}

impl ActiveBuffer {
    fn is_dirty(&self) -> bool {
        self.generation != self.saved_generation
    }
}

struct InFlight {
    id: String,
    generation: u64,
}

struct SaveOutcome {
    id: String,
    generation: u64,
    result: Result<BufferMeta, FlashError>,
}

pub(super) struct Actor {
    store: Arc<dyn BufferStore>,
    config: SessionConfig,
    state: SessionState,
    active: Option<ActiveBuffer>,
    sidebar: Vec<BufferSummary>,
    has_more: bool,
    search_results: Vec<crate::db::SearchResult>,
    in_flight: Option<InFlight>,
    resave_queued: bool,
    /// Consecutive failed attempts for the current pending content.
    attempts: u32,
    last_error: Option<String>,
    save_deadline: Option<Instant>,
    done_tx: mpsc::UnboundedSender<SaveOutcome>,
    done_rx: mpsc::UnboundedReceiver<SaveOutcome>,
}

/// Resolves at `deadline`, or never when there isn't one.
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    pub(super) fn new(store: Arc<dyn BufferStore>, config: SessionConfig) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            store,
            config,
            state: SessionState::Idle,
            active: None,
            sidebar: Vec::new(),
            has_more: false,
            search_results: Vec::new(),
            in_flight: None,
            resave_queued: false,
            attempts: 0,
            last_error: None,
            save_deadline: None,
            done_tx,
            done_rx,
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle(cmd).await {
                            break;
                        }
                    }
                    None => {
                        debug!("session handles dropped, flushing");
                        self.blur().await;
                        break;
                    }
                },
                Some(outcome) = self.done_rx.recv() => self.on_save_complete(outcome),
                _ = sleep_until_deadline(self.save_deadline) => {
                    self.save_deadline = None;
                    self.dispatch_save();
                }
            }
        }
        debug!("session actor stopped");
    }

    /// Returns false once the actor should stop.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            Command::Create(reply) => {
                let _ = reply.send(self.create().await);
            }
            Command::Select(id, reply) => {
                let _ = reply.send(self.select(id).await);
            }
            Command::Edit(content, reply) => {
                let _ = reply.send(self.edit(content));
            }
            Command::Delete(id, reply) => {
                let _ = reply.send(self.delete(id).await);
            }
            Command::TogglePin(id, reply) => {
                let _ = reply.send(self.toggle_pin(id).await);
            }
            Command::Reorder(ids, reply) => {
                let _ = reply.send(self.reorder(ids).await);
            }
            Command::MoveActive(direction, reply) => {
                let _ = reply.send(self.move_active(direction).await);
            }
            Command::Search(query, reply) => {
                let _ = reply.send(self.search(query).await);
            }
            Command::LoadMore(reply) => {
                let _ = reply.send(self.load_more().await);
            }
            Command::CleanupEmpty(reply) => {
                let _ = reply.send(self.cleanup_empty().await);
            }
            Command::RetrySave(reply) => {
                let _ = reply.send(self.flush_now().await);
            }
            Command::Blur(reply) => {
                let _ = reply.send(Ok(self.blur().await));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Shutdown(reply) => {
                self.blur().await;
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    /// Run a store call on the blocking pool.
    fn call<T, F>(&self, f: F) -> impl Future<Output = Result<T, FlashError>> + Send + 'static
    where
        F: FnOnce(&dyn BufferStore) -> Result<T, FlashError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        async move { crate::db_call(&store, move |s| f(s)).await.and_then(|r| r) }
    }

    fn is_dirty(&self) -> bool {
        self.active.as_ref().is_some_and(ActiveBuffer::is_dirty)
    }

    fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.id.as_str())
    }

    fn activate(&mut self, id: String, content: String) {
        self.active = Some(ActiveBuffer {
            id,
            content,
            generation: 0,
            saved_generation: 0,
        });
        self.state = SessionState::Viewing;
        self.reset_save_state();
    }

    fn deactivate(&mut self) {
        self.active = None;
        self.state = SessionState::Idle;
        self.reset_save_state();
    }

    fn reset_save_state(&mut self) {
        self.attempts = 0;
        self.last_error = None;
        self.resave_queued = false;
        self.save_deadline = None;
    }

    fn first_unpinned(&self) -> usize {
        self.sidebar
            .iter()
            .position(|b| !b.is_pinned)
            .unwrap_or(self.sidebar.len())
    }

    /// Replace the loaded window with the store's current order.
    async fn refresh_window(&mut self) -> Result<(), FlashError> {
        let limit = self.sidebar.len().max(self.config.page_size);
        let page = self.call(move |s| s.list_page(0, limit)).await?;
        self.has_more = page.len() == limit;
        self.sidebar = page;
        Ok(())
    }

    // ---- save pipeline ----

    fn dispatch_save(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        if !active.is_dirty() {
            return;
        }
        if self.in_flight.is_some() {
            self.resave_queued = true;
            return;
        }

        let id = active.id.clone();
        let content = active.content.clone();
        let generation = active.generation;
        self.in_flight = Some(InFlight {
            id: id.clone(),
            generation,
        });
        self.resave_queued = false;
        self.attempts += 1;
        self.state = SessionState::Saving;
        debug!(id = %id, generation, attempt = self.attempts, "dispatching save");

        let store = Arc::clone(&self.store);
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let save_id = id.clone();
            let result = crate::db_call(&store, move |s| s.save(&save_id, &content))
                .await
                .and_then(|r| r);
            let _ = done.send(SaveOutcome {
                id,
                generation,
                result,
            });
        });
    }

    fn apply_meta(&mut self, id: &str, meta: &BufferMeta) {
        if let Some(entry) = self.sidebar.iter_mut().find(|b| b.id == id) {
            entry.title = meta.title.clone();
            entry.preview = meta.preview.clone();
            entry.updated_at = entry.updated_at.max(now_secs());
        }
    }

    fn on_save_complete(&mut self, outcome: SaveOutcome) {
        if let Some(flight) = &self.in_flight {
            if flight.id != outcome.id || flight.generation != outcome.generation {
                warn!(id = %outcome.id, "save completion does not match in-flight save");
            }
        }
        self.in_flight = None;

        if let Ok(meta) = &outcome.result {
            self.apply_meta(&outcome.id, meta);
        }

        let Some(active) = self.active.as_mut().filter(|a| a.id == outcome.id) else {
            debug!(id = %outcome.id, "save completed for inactive buffer");
            return;
        };

        match outcome.result {
            Ok(_) => {
                active.saved_generation = active.saved_generation.max(outcome.generation);
                let dirty = active.is_dirty();
                self.attempts = 0;
                self.last_error = None;
                if dirty {
                    self.state = SessionState::Editing;
                    if self.resave_queued && self.save_deadline.is_none() {
                        self.dispatch_save();
                    }
                } else {
                    self.state = SessionState::Viewing;
                }
                self.resave_queued = false;
            }
            Err(e) => {
                self.resave_queued = false;
                if e.is_retryable() && self.attempts < self.config.max_save_attempts {
                    warn!(id = %outcome.id, attempt = self.attempts, error = %e, "save failed, will retry");
                    self.state = SessionState::Editing;
                    self.save_deadline = Some(Instant::now() + self.config.retry_backoff * self.attempts);
                } else {
                    warn!(id = %outcome.id, attempts = self.attempts, error = %e, "save failed, giving up");
                    self.state = SessionState::SaveFailed;
                    self.last_error = Some(e.to_string());
                    self.save_deadline = None;
                }
            }
        }
    }

    async fn wait_in_flight(&mut self) {
        while self.in_flight.is_some() {
            match self.done_rx.recv().await {
                Some(outcome) => self.on_save_complete(outcome),
                None => break,
            }
        }
    }

    /// Save pending edits now, retrying per config. Clears a previous
    /// `SaveFailed` and tries again from the first attempt.
    async fn flush_now(&mut self) -> Result<(), FlashError> {
        if self.state == SessionState::SaveFailed {
            self.attempts = 0;
            self.state = SessionState::Editing;
        }
        loop {
            self.save_deadline = None;
            self.wait_in_flight().await;
            if self.state == SessionState::SaveFailed {
                return Err(FlashError::SaveFailed(
                    self.last_error.clone().unwrap_or_default(),
                ));
            }
            if !self.is_dirty() {
                return Ok(());
            }
            if self.attempts > 0 {
                tokio::time::sleep(self.config.retry_backoff * self.attempts).await;
            }
            self.dispatch_save();
        }
    }

    /// Flush with an upper bound. Never discards content: on failure the
    /// session is left in `SaveFailed` (or still saving) for a later retry.
    async fn blur(&mut self) -> bool {
        match tokio::time::timeout(self.config.flush_timeout, self.flush_now()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "flush on blur failed");
                false
            }
            Err(_) => {
                warn!(timeout_ms = self.config.flush_timeout.as_millis() as u64, "flush on blur timed out");
                if self.in_flight.is_none() && self.is_dirty() {
                    self.state = SessionState::SaveFailed;
                    self.last_error = Some("flush timed out".into());
                    self.save_deadline = None;
                }
                false
            }
        }
    }

    // ---- commands ----

    async fn start(&mut self) -> Result<(), FlashError> {
        if self.config.cleanup_on_start {
            match self.call(|s| s.cleanup_empty(None)).await {
                Ok(removed) if !removed.is_empty() => {
                    info!(count = removed.len(), "removed empty buffers on start");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "startup cleanup failed"),
            }
        }
        let limit = self.config.page_size;
        let page = self.call(move |s| s.list_page(0, limit)).await?;
        self.has_more = page.len() == limit;
        self.sidebar = page;
        Ok(())
    }

    async fn create(&mut self) -> Result<BufferSummary, FlashError> {
        self.flush_now().await?;
        let summary = self.call(|s| s.create(None)).await?;
        let at = self.first_unpinned();
        self.sidebar.insert(at, summary.clone());
        self.activate(summary.id.clone(), String::new());
        Ok(summary)
    }

    async fn select(&mut self, id: String) -> Result<String, FlashError> {
        if let Some(active) = self.active.as_ref().filter(|a| a.id == id) {
            return Ok(active.content.clone());
        }
        self.flush_now().await?;

        let open_id = id.clone();
        match self.call(move |s| s.open_buffer(&open_id)).await {
            Ok(content) => {
                self.activate(id, content.clone());
                Ok(content)
            }
            Err(e) => {
                if matches!(e, FlashError::NotFound(_)) {
                    self.sidebar.retain(|b| b.id != id);
                }
                Err(e)
            }
        }
    }

    fn edit(&mut self, content: String) -> Result<(), FlashError> {
        let active = self.active.as_mut().ok_or(FlashError::NoActiveBuffer)?;
        if active.content == content {
            return Ok(());
        }
        active.content = content;
        active.generation += 1;

        if self.state == SessionState::SaveFailed {
            self.attempts = 0;
            self.last_error = None;
        }
        if self.in_flight.is_some() {
            self.resave_queued = true;
        } else {
            self.state = SessionState::Editing;
        }
        self.save_deadline = Some(Instant::now() + self.config.debounce);
        Ok(())
    }

    async fn delete(&mut self, id: String) -> Result<Option<String>, FlashError> {
        let was_active = self.active_id() == Some(id.as_str());
        if was_active {
            // let a running save land before the row goes away
            self.save_deadline = None;
            self.wait_in_flight().await;
            self.save_deadline = None;
        }

        let delete_id = id.clone();
        let result = self.call(move |s| s.delete(&delete_id)).await;
        match result {
            Ok(next) => {
                self.sidebar.retain(|b| b.id != id);
                if was_active {
                    self.deactivate();
                    if let Some(next_id) = next.clone() {
                        if let Err(e) = self.select(next_id).await {
                            warn!(error = %e, "could not open next buffer after delete");
                        }
                    }
                }
                Ok(next)
            }
            Err(e) => {
                if matches!(e, FlashError::NotFound(_)) {
                    self.sidebar.retain(|b| b.id != id);
                    if was_active {
                        self.deactivate();
                    }
                } else if was_active && self.is_dirty() {
                    self.save_deadline = Some(Instant::now() + self.config.debounce);
                }
                Err(e)
            }
        }
    }

    async fn toggle_pin(&mut self, id: String) -> Result<bool, FlashError> {
        let pin_id = id.clone();
        let pinned = self.call(move |s| s.toggle_pin(&pin_id)).await?;

        if let Some(pos) = self.sidebar.iter().position(|b| b.id == id) {
            let mut entry = self.sidebar.remove(pos);
            entry.is_pinned = pinned;
            let at = self.first_unpinned();
            self.sidebar.insert(at, entry);
        }
        if pinned {
            // pinned rows sort by insertion rank, which summaries don't carry
            if let Err(e) = self.refresh_window().await {
                warn!(id = %id, error = %e, "sidebar refetch after pin failed");
            }
        }
        Ok(pinned)
    }

    async fn reorder(&mut self, ids: Vec<String>) -> Result<(), FlashError> {
        let previous = self.sidebar.clone();

        let (pinned, unpinned): (Vec<_>, Vec<_>) =
            self.sidebar.drain(..).partition(|b| b.is_pinned);
        let current: Vec<String> = unpinned.iter().map(|b| b.id.clone()).collect();
        let mut by_id: HashMap<String, BufferSummary> =
            unpinned.into_iter().map(|b| (b.id.clone(), b)).collect();
        self.sidebar = pinned;
        for id in merge_order(&current, &ids) {
            if let Some(entry) = by_id.remove(&id) {
                self.sidebar.push(entry);
            }
        }

        let result = self.call(move |s| s.reorder(&ids)).await;
        if let Err(e) = &result {
            warn!(error = %e, "reorder failed, refetching sidebar");
            if let Err(refetch) = self.refresh_window().await {
                warn!(error = %refetch, "sidebar refetch failed, restoring previous order");
                self.sidebar = previous;
            }
        }
        result
    }

    async fn move_active(&mut self, direction: Direction) -> Result<bool, FlashError> {
        let Some(id) = self.active_id().map(str::to_string) else {
            return Ok(false);
        };
        let move_id = id.clone();
        let moved = self.call(move |s| s.move_buffer(&move_id, direction)).await?;
        if !moved {
            return Ok(false);
        }
        let neighbour = self.sidebar.iter().position(|b| b.id == id).and_then(|pos| {
            let n = match direction {
                Direction::Up => pos.checked_sub(1)?,
                Direction::Down => pos + 1,
            };
            self.sidebar
                .get(n)
                .filter(|b| !b.is_pinned)
                .map(|_| (pos, n))
        });
        match neighbour {
            Some((pos, n)) => self.sidebar.swap(pos, n),
            // swapped with a row past the loaded window
            None => {
                if let Err(e) = self.refresh_window().await {
                    warn!(id = %id, error = %e, "sidebar refetch after move failed");
                }
            }
        }
        Ok(true)
    }

    async fn search(&mut self, query: String) -> Result<Vec<crate::db::SearchResult>, FlashError> {
        let results = self
            .call(move |s| s.search(&query, DEFAULT_SEARCH_LIMIT))
            .await?;
        self.search_results = results.clone();
        Ok(results)
    }

    async fn load_more(&mut self) -> Result<usize, FlashError> {
        let offset = self.sidebar.len();
        let limit = self.config.page_size;
        let page = self.call(move |s| s.list_page(offset, limit)).await?;
        let fetched = page.len();
        self.has_more = fetched == limit;
        for entry in page {
            if !self.sidebar.iter().any(|b| b.id == entry.id) {
                self.sidebar.push(entry);
            }
        }
        Ok(fetched)
    }

    async fn cleanup_empty(&mut self) -> Result<Vec<String>, FlashError> {
        let exclude = self.active_id().map(str::to_string);
        let removed = self
            .call(move |s| s.cleanup_empty(exclude.as_deref()))
            .await?;
        self.sidebar.retain(|b| !removed.contains(&b.id));
        Ok(removed)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            active_id: self.active.as_ref().map(|a| a.id.clone()),
            active_content: self.active.as_ref().map(|a| a.content.clone()),
            dirty: self.is_dirty(),
            sidebar: self.sidebar.clone(),
            has_more: self.has_more,
            search_results: self.search_results.clone(),
            last_error: self.last_error.clone(),
        }
    }
}
