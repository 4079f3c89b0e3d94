pub mod api;
pub mod db;
pub mod error;
pub mod session;
pub mod util;

use std::path::PathBuf;
use std::sync::Arc;

pub type SharedStore = Arc<db::Store>;

/// Run a blocking storage operation on tokio's blocking thread pool.
///
/// All synchronous store calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn db_call<S, F, T>(store: &Arc<S>, f: F) -> Result<T, error::FlashError>
where
    S: ?Sized + Send + Sync + 'static,
    F: FnOnce(&S) -> T + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&*store))
        .await
        .map_err(|e| error::FlashError::Internal(e.to_string()))
}

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    /// Where backups land. `None` for in-memory stores.
    pub data_dir: Option<PathBuf>,
    pub max_backups: usize,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(store: db::Store, data_dir: Option<PathBuf>) -> Self {
        Self {
            store: Arc::new(store),
            data_dir,
            max_backups: db::backup::DEFAULT_MAX_BACKUPS,
            started_at: std::time::Instant::now(),
        }
    }
}
