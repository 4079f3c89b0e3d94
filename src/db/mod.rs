//! SQLite-backed buffer storage with an FTS5 mirror.

pub mod backup;
mod buffer;
mod fts;
mod ordering;
mod schema;

pub use fts::{build_match_query, MAX_QUERY_LEN, MAX_QUERY_TOKENS};
pub use ordering::merge_order;
pub use schema::LATEST_SCHEMA_VERSION;

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::FlashError;

/// Bounded wait for a locked database or a held writer, so a stuck writer
/// surfaces as a retryable error instead of a hang.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub const DB_FILE_NAME: &str = "flashnotes.db";

const MAX_CONTENT_BYTES: usize = 8 * 1024 * 1024;
const MAX_SETTING_KEY_LEN: usize = 64;
const MAX_SETTING_VALUE_BYTES: usize = 4096;
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 200;
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

// auto_vacuum only takes effect before the first table is created.
const WRITER_PRAGMAS: &str = "
    PRAGMA auto_vacuum = INCREMENTAL;
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA trusted_schema = ON;
    PRAGMA temp_store = MEMORY;
    PRAGMA cache_size = -64000;
";

const READER_PRAGMAS: &str = "
    PRAGMA foreign_keys = ON;
    PRAGMA trusted_schema = ON;
    PRAGMA temp_store = MEMORY;
    PRAGMA cache_size = -32000;
    PRAGMA query_only = ON;
";

/// Set busy_timeout on every connection handed out by the pool.
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Sidebar row: derived title/preview plus the fields the list renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSummary {
    pub id: String,
    pub title: String,
    pub preview: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_pinned: bool,
}

/// Derived metadata returned by a save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferMeta {
    pub title: String,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    pub id: String,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub accessed_at: i64,
    pub is_pinned: bool,
    pub is_archived: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub snippet: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub total: usize,
    pub archived: usize,
    pub indexed: usize,
    pub fts_consistent: bool,
    pub schema_version: i64,
    pub ok: bool,
}

fn validate_content(content: &str) -> Result<(), FlashError> {
    if content.len() > MAX_CONTENT_BYTES {
        return Err(FlashError::Validation(format!(
            "content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    Ok(())
}

/// SQLite problems that mean the file itself can't be trusted.
fn classify_open_error(e: rusqlite::Error) -> FlashError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => {
            FlashError::Corruption(e.to_string())
        }
        _ => FlashError::Storage(e),
    }
}

/// Single-writer buffer store: one mutex-guarded writer connection for every
/// mutation, a small pool of read-only connections for queries.
pub struct Store {
    writer: Mutex<Connection>,
    readers: Pool<SqliteConnectionManager>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) a database at the given path. `":memory:"` gives a
    /// private in-memory database shared by the writer and the reader pool.
    pub fn open(path: &str) -> Result<Self, FlashError> {
        let in_memory = path == ":memory:";
        let target = if in_memory {
            // Shared cache so all connections see the same in-memory DB.
            // Each store gets a unique name to avoid cross-test pollution.
            format!("file:flashnotes-{}?mode=memory&cache=shared", uuid::Uuid::new_v4())
        } else {
            path.to_string()
        };

        let mut writer = Connection::open(&target).map_err(classify_open_error)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        writer.execute_batch(WRITER_PRAGMAS).map_err(classify_open_error)?;
        quick_check(&writer)?;

        let file = (!in_memory).then(|| PathBuf::from(path));
        schema::migrate(&mut writer, file.as_deref())?;

        let manager = SqliteConnectionManager::file(&target)
            .with_init(|c| c.execute_batch(READER_PRAGMAS));
        let readers = Pool::builder()
            .max_size(if in_memory { 2 } else { 4 })
            .connection_timeout(BUSY_TIMEOUT)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)?;

        let store = Self {
            writer: Mutex::new(writer),
            readers,
            path: file,
        };
        store.heal_index()?;
        info!(path = %path, schema = LATEST_SCHEMA_VERSION, "buffer store open");
        Ok(store)
    }

    /// Backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, Connection>, FlashError> {
        self.writer
            .try_lock_for(BUSY_TIMEOUT)
            .ok_or_else(|| FlashError::Busy("writer lock held too long".into()))
    }

    pub(crate) fn reader(&self) -> Result<PooledConn, FlashError> {
        Ok(self.readers.get()?)
    }

    /// Database file size in bytes (via SQLite pragma).
    pub fn db_size_bytes(&self) -> Result<i64, FlashError> {
        Ok(self.reader()?.query_row(
            "SELECT page_count * page_size FROM pragma_page_count, pragma_page_size",
            [],
            |r| r.get(0),
        )?)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, FlashError> {
        use rusqlite::OptionalExtension;
        Ok(self
            .reader()?
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), FlashError> {
        validate_setting(key, value)?;
        self.writer()?.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn settings(&self) -> Result<std::collections::BTreeMap<String, String>, FlashError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// Fold the WAL back into the main file. Called on clean shutdown.
    pub fn checkpoint(&self) -> Result<(), FlashError> {
        self.writer()?
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Run incremental vacuum, returning bytes freed.
    pub fn vacuum_incremental(&self, pages: u32) -> Result<i64, FlashError> {
        let conn = self.writer()?;
        let size = |c: &Connection| -> rusqlite::Result<i64> {
            c.query_row(
                "SELECT page_count * page_size FROM pragma_page_count, pragma_page_size",
                [],
                |r| r.get(0),
            )
        };
        let before = size(&conn)?;
        conn.execute_batch(&format!("PRAGMA incremental_vacuum({pages});"))?;
        let after = size(&conn)?;
        Ok(before - after)
    }
}

fn quick_check(conn: &Connection) -> Result<(), FlashError> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |r| r.get(0))
        .map_err(classify_open_error)?;
    if verdict != "ok" {
        return Err(FlashError::Corruption(format!("quick_check: {verdict}")));
    }
    Ok(())
}

fn row_to_summary(row: &rusqlite::Row) -> rusqlite::Result<BufferSummary> {
    let content: String = row.get("content")?;
    let (title, preview) = crate::util::derive_title_preview(&content);
    Ok(BufferSummary {
        id: row.get("id")?,
        title,
        preview,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        is_pinned: row.get("is_pinned")?,
    })
}

fn validate_setting(key: &str, value: &str) -> Result<(), FlashError> {
    let key_ok = !key.is_empty()
        && key.len() <= MAX_SETTING_KEY_LEN
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !key_ok {
        return Err(FlashError::Validation(format!("invalid setting key: {key:?}")));
    }
    if value.len() > MAX_SETTING_VALUE_BYTES {
        return Err(FlashError::Validation(format!(
            "setting value too large: {} bytes (max {MAX_SETTING_VALUE_BYTES})",
            value.len()
        )));
    }
    Ok(())
}

fn row_to_buffer(row: &rusqlite::Row) -> rusqlite::Result<Buffer> {
    Ok(Buffer {
        id: row.get("id")?,
        content: row.get("content")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        accessed_at: row.get("accessed_at")?,
        is_pinned: row.get("is_pinned")?,
        is_archived: row.get("is_archived")?,
        sort_order: row.get("sort_order")?,
    })
}
