//! FTS5 full-text search over buffer content.
//!
//! The index is external-content (`content='buffers'`): it holds tokens only
//! and is maintained by triggers inside the same transaction as each write.

use rusqlite::params;
use tracing::{info, warn};

use super::*;

pub const MAX_QUERY_LEN: usize = 256;
pub const MAX_QUERY_TOKENS: usize = 16;

/// Turn user input into an FTS5 MATCH expression: every whitespace token
/// becomes a quoted prefix phrase, implicitly ANDed.
///
/// Tokens may contain only letters, digits and `-`; anything else rejects the
/// whole query instead of being escaped, so user text can never reach FTS5
/// as operators or column filters. Returns `None` for a query with nothing
/// searchable in it.
pub fn build_match_query(query: &str) -> Result<Option<String>, FlashError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_QUERY_LEN {
        return Err(FlashError::Validation(format!(
            "query too long (max {MAX_QUERY_LEN} chars)"
        )));
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if tokens.len() > MAX_QUERY_TOKENS {
        return Err(FlashError::Validation(format!(
            "too many search terms (max {MAX_QUERY_TOKENS})"
        )));
    }

    let mut phrases = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Some(bad) = token.chars().find(|c| !(c.is_alphanumeric() || *c == '-')) {
            return Err(FlashError::Validation(format!(
                "unsupported character {bad:?} in search query"
            )));
        }
        // a bare "-" tokenizes to nothing
        if token.chars().any(char::is_alphanumeric) {
            phrases.push(format!("\"{token}\"*"));
        }
    }

    if phrases.is_empty() {
        Ok(None)
    } else {
        Ok(Some(phrases.join(" ")))
    }
}

impl Store {
    /// Ranked search over non-archived buffers. Best match first, ties broken
    /// by most recently updated. Snippets mark hits with `<mark>`.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, FlashError> {
        let Some(expr) = build_match_query(query)? else {
            return Ok(Vec::new());
        };
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT b.id, snippet(buffers_fts, 0, '<mark>', '</mark>', '…', 16), b.updated_at \
             FROM buffers_fts JOIN buffers b ON b.pk = buffers_fts.rowid \
             WHERE buffers_fts MATCH ?1 AND b.is_archived = 0 \
             ORDER BY rank, b.updated_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![expr, limit as i64], |row| {
                Ok(SearchResult {
                    id: row.get(0)?,
                    snippet: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Run FTS5's own consistency check against the content table.
    fn fts_consistent(&self) -> Result<bool, FlashError> {
        let conn = self.writer()?;
        match conn.execute(
            "INSERT INTO buffers_fts(buffers_fts, rank) VALUES ('integrity-check', 1)",
            [],
        ) {
            Ok(_) => Ok(true),
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::DatabaseCorrupt) => {
                warn!(error = %e, "FTS index out of sync");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn integrity(&self) -> Result<IntegrityReport, FlashError> {
        let (total, archived, indexed, schema_version) = {
            let conn = self.reader()?;
            let (total, archived): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(is_archived), 0) FROM buffers",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let indexed: i64 =
                conn.query_row("SELECT COUNT(*) FROM buffers_fts_docsize", [], |r| r.get(0))?;
            let version = schema::current_version(&conn)?;
            (total, archived, indexed, version)
        };
        let fts_consistent = self.fts_consistent()?;
        Ok(IntegrityReport {
            total: total as usize,
            archived: archived as usize,
            indexed: indexed as usize,
            fts_consistent,
            schema_version,
            ok: fts_consistent && total == indexed,
        })
    }

    /// Drop and rebuild the index from the content table. Returns rows indexed.
    pub fn rebuild_index(&self) -> Result<usize, FlashError> {
        let conn = self.writer()?;
        conn.execute("INSERT INTO buffers_fts(buffers_fts) VALUES ('rebuild')", [])?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM buffers", [], |r| r.get(0))?;
        info!(rows = n, "rebuilt FTS index");
        Ok(n as usize)
    }

    /// Startup self-heal: rebuild only when the index disagrees with content.
    pub(super) fn heal_index(&self) -> Result<(), FlashError> {
        if !self.fts_consistent()? {
            self.rebuild_index()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "fts_tests.rs"]
mod tests;
