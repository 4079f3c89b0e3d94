//! Point-in-time snapshots via `VACUUM INTO`, with retention.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{info, warn};

use super::Store;
use crate::error::FlashError;
use crate::util::now_ms;

pub const DEFAULT_MAX_BACKUPS: usize = 7;
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const BACKUP_PREFIX: &str = "flashnotes_";
pub(super) const PREMIGRATION_PREFIX: &str = "flashnotes_premigration_";

pub fn backup_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("backups")
}

/// Regular backups as (path, unix ms), newest first. Pre-migration
/// snapshots don't parse as a plain timestamp and are never pruned.
fn list_backups(dir: &Path) -> Vec<(PathBuf, i64)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut backups: Vec<(PathBuf, i64)> = entries
        .filter_map(Result::ok)
        .filter_map(|e| {
            let name = e.file_name();
            let ts = name
                .to_str()?
                .strip_prefix(BACKUP_PREFIX)?
                .strip_suffix(".db")?
                .parse::<i64>()
                .ok()?;
            Some((e.path(), ts))
        })
        .collect();
    backups.sort_by(|a, b| b.1.cmp(&a.1));
    backups
}

pub fn last_backup_ms(data_dir: &Path) -> Option<i64> {
    list_backups(&backup_dir(data_dir)).first().map(|(_, ts)| *ts)
}

/// True when no regular backup exists or the newest is older than `interval`.
pub fn needs_backup(data_dir: &Path, interval: Duration) -> bool {
    match last_backup_ms(data_dir) {
        Some(last) => now_ms().saturating_sub(last) >= interval.as_millis() as i64,
        None => true,
    }
}

/// Delete all but the newest `keep` regular backups. Returns how many went.
pub fn prune_backups(dir: &Path, keep: usize) -> usize {
    let mut removed = 0;
    for (path, _) in list_backups(dir).into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                info!(path = %path.display(), "removed old backup");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old backup"),
        }
    }
    removed
}

/// Write a consistent copy of the database into `dir/backups`.
pub(super) fn snapshot(conn: &Connection, dir: &Path, prefix: &str) -> Result<PathBuf, FlashError> {
    let backups = backup_dir(dir);
    fs::create_dir_all(&backups)?;
    let target = backups.join(format!("{prefix}{}.db", now_ms()));
    conn.execute("VACUUM INTO ?1", [target.to_string_lossy().into_owned()])?;
    Ok(target)
}

/// Move an unreadable database (and its WAL/SHM sidecars) out of the way so
/// a fresh one can be created at `path`. Returns the quarantined main file.
pub fn quarantine(path: &Path) -> Result<PathBuf, FlashError> {
    let mut moved = path.as_os_str().to_owned();
    moved.push(format!(".corrupt-{}", now_ms()));
    let moved = PathBuf::from(moved);
    fs::rename(path, &moved)?;
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let side = PathBuf::from(side);
        if side.exists() {
            let mut dest = moved.as_os_str().to_owned();
            dest.push(suffix);
            fs::rename(&side, PathBuf::from(dest))?;
        }
    }
    warn!(from = %path.display(), to = %moved.display(), "quarantined unreadable database");
    Ok(moved)
}

impl Store {
    /// Snapshot into `data_dir/backups` and prune to `max_backups`.
    pub fn create_backup(&self, data_dir: &Path, max_backups: usize) -> Result<PathBuf, FlashError> {
        let path = {
            let conn = self.writer()?;
            snapshot(&conn, data_dir, BACKUP_PREFIX)?
        };
        info!(path = %path.display(), "backup created");
        prune_backups(&backup_dir(data_dir), max_backups);
        Ok(path)
    }
}
