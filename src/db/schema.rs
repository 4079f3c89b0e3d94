//! Versioned schema migrations.
//!
//! Every migration runs in its own IMMEDIATE transaction together with the
//! `schema_migrations` row that records it, so a crash mid-upgrade leaves the
//! database at the previous version rather than half-migrated.

use std::path::Path;

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{info, warn};

use crate::error::FlashError;
use crate::util::now_secs;

struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration { version: 1, name: "buffers", apply: create_buffers },
    Migration { version: 2, name: "buffers_fts", apply: create_fts },
];

pub const LATEST_SCHEMA_VERSION: i64 = 2;

const MIGRATIONS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at INTEGER NOT NULL
);
";

// `pk` is the FTS content rowid. It must be an explicit INTEGER PRIMARY KEY:
// VACUUM is free to renumber implicit rowids, which would orphan the index.
const BUFFERS_SCHEMA: &str = "
CREATE TABLE buffers (
    pk INTEGER PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    accessed_at INTEGER NOT NULL,
    is_archived INTEGER NOT NULL DEFAULT 0,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    sort_order INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_buffers_sidebar
    ON buffers (is_archived, is_pinned, sort_order);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR IGNORE INTO settings (key, value) VALUES
    ('font_family', 'JetBrains Mono'),
    ('font_size', '13'),
    ('line_height', '1.5');
";

const FTS_SCHEMA: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS buffers_fts USING fts5(
    content,
    content='buffers',
    content_rowid='pk',
    tokenize='unicode61'
);

CREATE TRIGGER IF NOT EXISTS buffers_fts_ai AFTER INSERT ON buffers BEGIN
    INSERT INTO buffers_fts(rowid, content) VALUES (new.pk, new.content);
END;

CREATE TRIGGER IF NOT EXISTS buffers_fts_ad AFTER DELETE ON buffers BEGIN
    INSERT INTO buffers_fts(buffers_fts, rowid, content) VALUES ('delete', old.pk, old.content);
END;

CREATE TRIGGER IF NOT EXISTS buffers_fts_au AFTER UPDATE OF content ON buffers BEGIN
    INSERT INTO buffers_fts(buffers_fts, rowid, content) VALUES ('delete', old.pk, old.content);
    INSERT INTO buffers_fts(rowid, content) VALUES (new.pk, new.content);
END;

INSERT INTO buffers_fts(buffers_fts) VALUES ('rebuild');
";

// Unversioned databases from before migrations were tracked: implicit rowid,
// `id TEXT PRIMARY KEY`, rowid-keyed FTS and triggers named buffers_a*.
const DROP_LEGACY_FTS: &str = "
DROP TRIGGER IF EXISTS buffers_ai;
DROP TRIGGER IF EXISTS buffers_ad;
DROP TRIGGER IF EXISTS buffers_au;
DROP TABLE IF EXISTS buffers_fts;
DROP INDEX IF EXISTS idx_buffers_sidebar;
ALTER TABLE buffers RENAME TO buffers_legacy;
";

// Display order of legacy rows (manual order, then most recently used)
// becomes the initial sort_order; insertion follows creation time so `pk`
// reflects it.
const COPY_LEGACY: &str = "
INSERT INTO buffers
    (id, content, created_at, updated_at, accessed_at, is_archived, is_pinned, sort_order)
SELECT id, content, created_at, updated_at, accessed_at,
       COALESCE(is_archived, 0), COALESCE(is_pinned, 0),
       ROW_NUMBER() OVER (ORDER BY sort_order ASC, accessed_at DESC) - 1
FROM buffers_legacy
ORDER BY created_at ASC;
DROP TABLE buffers_legacy;
";

pub(super) fn has_table(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [name],
        |r| r.get(0),
    )
}

pub(super) fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| {
        r.get(0)
    })
}

fn create_buffers(conn: &Connection) -> rusqlite::Result<()> {
    if !has_table(conn, "buffers")? {
        return conn.execute_batch(BUFFERS_SCHEMA);
    }

    // Additive columns first so the copy below can read them uniformly.
    if conn.prepare("SELECT sort_order FROM buffers LIMIT 0").is_err() {
        conn.execute("ALTER TABLE buffers ADD COLUMN sort_order INTEGER DEFAULT 0", [])?;
    }
    if conn.prepare("SELECT is_pinned FROM buffers LIMIT 0").is_err() {
        conn.execute("ALTER TABLE buffers ADD COLUMN is_pinned INTEGER DEFAULT 0", [])?;
    }
    conn.execute_batch(DROP_LEGACY_FTS)?;
    conn.execute_batch(BUFFERS_SCHEMA)?;
    conn.execute_batch(COPY_LEGACY)?;
    let moved: i64 = conn.query_row("SELECT COUNT(*) FROM buffers", [], |r| r.get(0))?;
    info!(rows = moved, "upgraded unversioned buffers table");
    Ok(())
}

fn create_fts(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(FTS_SCHEMA)
}

/// Bring the schema up to [`LATEST_SCHEMA_VERSION`]. Idempotent; refuses to
/// touch a database written by a newer build.
pub(super) fn migrate(conn: &mut Connection, db_file: Option<&Path>) -> Result<(), FlashError> {
    let had_buffers = has_table(conn, "buffers")?;
    conn.execute_batch(MIGRATIONS_TABLE)?;

    let current = current_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(FlashError::Corruption(format!(
            "schema version {current} is newer than this build ({LATEST_SCHEMA_VERSION})"
        )));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(());
    }

    if had_buffers {
        if let Some(dir) = db_file.and_then(Path::parent) {
            match super::backup::snapshot(conn, dir, super::backup::PREMIGRATION_PREFIX) {
                Ok(path) => info!(path = %path.display(), "pre-migration backup written"),
                Err(e) => {
                    warn!(error = %e, "pre-migration backup failed, not migrating");
                    return Err(e);
                }
            }
        }
    }

    for m in pending {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        (m.apply)(&tx)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![m.version, m.name, now_secs()],
        )?;
        tx.commit()?;
        info!(version = m.version, name = m.name, "applied migration");
    }
    Ok(())
}
