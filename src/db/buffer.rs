//! Buffer CRUD and sidebar queries.

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ordering::{DISPLAY_ORDER, NEXT_TOP_SORT_ORDER};
use super::*;
use crate::util::{derive_title_preview, now_secs};

const BUFFER_COLS: &str =
    "id, content, created_at, updated_at, accessed_at, is_pinned, is_archived, sort_order";

// pages freed per cleanup sweep
const CLEANUP_VACUUM_PAGES: u32 = 1000;

impl Store {
    /// Insert a new buffer at the top of the unpinned list.
    pub fn create(&self, initial_content: Option<&str>) -> Result<BufferSummary, FlashError> {
        let content = initial_content.unwrap_or("");
        validate_content(content)?;
        let id = Uuid::new_v4().to_string();
        let now = now_secs();

        self.writer()?.execute(
            &format!(
                "INSERT INTO buffers (id, content, created_at, updated_at, accessed_at, sort_order) \
                 VALUES (?1, ?2, ?3, ?3, ?3, {NEXT_TOP_SORT_ORDER})"
            ),
            params![id, content, now],
        )?;
        debug!(id = %id, bytes = content.len(), "created buffer");

        let (title, preview) = derive_title_preview(content);
        Ok(BufferSummary {
            id,
            title,
            preview,
            created_at: now,
            updated_at: now,
            is_pinned: false,
        })
    }

    /// Persist content. Saving identical content again is harmless.
    pub fn save(&self, id: &str, content: &str) -> Result<BufferMeta, FlashError> {
        validate_content(content)?;
        let n = self.writer()?.execute(
            "UPDATE buffers SET content = ?1, updated_at = MAX(updated_at, ?2) WHERE id = ?3",
            params![content, now_secs(), id],
        )?;
        if n == 0 {
            return Err(FlashError::NotFound(id.to_string()));
        }
        debug!(id = %id, bytes = content.len(), "saved buffer");
        let (title, preview) = derive_title_preview(content);
        Ok(BufferMeta { title, preview })
    }

    pub fn get_content(&self, id: &str) -> Result<String, FlashError> {
        self.reader()?
            .query_row(
                "SELECT content FROM buffers WHERE id = ?1 AND is_archived = 0",
                [id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| FlashError::NotFound(id.to_string()))
    }

    /// Load content for editing and record the selection time.
    pub fn open_buffer(&self, id: &str) -> Result<String, FlashError> {
        let n = self.writer()?.execute(
            "UPDATE buffers SET accessed_at = MAX(accessed_at, ?1) WHERE id = ?2 AND is_archived = 0",
            params![now_secs(), id],
        )?;
        if n == 0 {
            return Err(FlashError::NotFound(id.to_string()));
        }
        self.get_content(id)
    }

    /// Full row, archived included.
    pub fn get(&self, id: &str) -> Result<Buffer, FlashError> {
        self.reader()?
            .query_row(
                &format!("SELECT {BUFFER_COLS} FROM buffers WHERE id = ?1"),
                [id],
                row_to_buffer,
            )
            .optional()?
            .ok_or_else(|| FlashError::NotFound(id.to_string()))
    }

    /// One page of the sidebar in display order.
    pub fn list_page(&self, offset: usize, limit: usize) -> Result<Vec<BufferSummary>, FlashError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT id, content, created_at, updated_at, is_pinned FROM buffers \
             WHERE is_archived = 0 {DISPLAY_ORDER} LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], row_to_summary)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self, include_archived: bool) -> Result<usize, FlashError> {
        let sql = if include_archived {
            "SELECT COUNT(*) FROM buffers"
        } else {
            "SELECT COUNT(*) FROM buffers WHERE is_archived = 0"
        };
        let n: i64 = self.reader()?.query_row(sql, [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Hide from sidebar and search without deleting.
    pub fn archive(&self, id: &str) -> Result<(), FlashError> {
        let n = self.writer()?.execute(
            "UPDATE buffers SET is_archived = 1, is_pinned = 0 WHERE id = ?1 AND is_archived = 0",
            [id],
        )?;
        if n == 0 {
            return Err(FlashError::NotFound(id.to_string()));
        }
        info!(id = %id, "archived buffer");
        Ok(())
    }

    /// Delete a buffer and return the id that should become active next:
    /// the one above it in display order, else the one below.
    pub fn delete(&self, id: &str) -> Result<Option<String>, FlashError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let order: Vec<String> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id FROM buffers WHERE is_archived = 0 {DISPLAY_ORDER}"
            ))?;
            let ids = stmt
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            ids
        };

        let n = tx.execute("DELETE FROM buffers WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(FlashError::NotFound(id.to_string()));
        }
        tx.commit()?;

        let next = order.iter().position(|x| x == id).and_then(|i| {
            if i > 0 {
                order.get(i - 1).cloned()
            } else {
                order.get(1).cloned()
            }
        });
        info!(id = %id, next = ?next, "deleted buffer");
        Ok(next)
    }

    /// Remove unpinned buffers whose content is only whitespace, sparing
    /// `exclude`. Returns the removed ids.
    pub fn cleanup_empty(&self, exclude: Option<&str>) -> Result<Vec<String>, FlashError> {
        let removed = {
            let mut conn = self.writer()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM buffers \
                     WHERE is_pinned = 0 AND trim(content, char(32, 9, 10, 11, 12, 13)) = '' \
                     AND id IS NOT ?1",
                )?;
                let ids = stmt
                    .query_map([exclude], |r| r.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                ids
            };
            {
                let mut del = tx.prepare("DELETE FROM buffers WHERE id = ?1")?;
                for id in &ids {
                    del.execute([id])?;
                }
            }
            tx.commit()?;
            ids
        };

        if !removed.is_empty() {
            info!(count = removed.len(), "cleaned up empty buffers");
            if let Err(e) = self.vacuum_incremental(CLEANUP_VACUUM_PAGES) {
                warn!(error = %e, "incremental vacuum after cleanup failed");
            }
        }
        Ok(removed)
    }
}
