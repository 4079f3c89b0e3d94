//! Manual ordering: sort_order allocation, reorder, move up/down, pinning.
//!
//! Display order is pinned first (by insertion), then unpinned by ascending
//! sort_order with ties going to the newest row. Every mutation here is a
//! read-compute-write inside one IMMEDIATE transaction on the writer.

use std::collections::HashSet;

use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

use super::*;

pub(super) const DISPLAY_ORDER: &str =
    "ORDER BY is_pinned DESC, CASE WHEN is_pinned = 1 THEN pk ELSE sort_order END ASC, pk DESC";

/// Scalar subquery giving a sort_order above everything currently stored.
pub(super) const NEXT_TOP_SORT_ORDER: &str =
    "(SELECT COALESCE(MIN(sort_order), 0) - 1 FROM buffers)";

/// Reconcile a client-supplied order with the current one.
///
/// Requested ids that aren't in `current` (unknown, pinned, archived) are
/// dropped, as are repeats. Ids the client left out keep their existing
/// relative order after the requested ones.
pub fn merge_order(current: &[String], requested: &[String]) -> Vec<String> {
    let live: HashSet<&str> = current.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(current.len());
    let mut merged = Vec::with_capacity(current.len());

    for id in requested {
        if live.contains(id.as_str()) && seen.insert(id.as_str()) {
            merged.push(id.clone());
        }
    }
    for id in current {
        if seen.insert(id.as_str()) {
            merged.push(id.clone());
        }
    }
    merged
}

fn unpinned_ids(tx: &Transaction) -> rusqlite::Result<Vec<String>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT id FROM buffers WHERE is_archived = 0 AND is_pinned = 0 {DISPLAY_ORDER}"
    ))?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn renumber(tx: &Transaction, ids: &[String]) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare_cached("UPDATE buffers SET sort_order = ?1 WHERE id = ?2")?;
    for (i, id) in ids.iter().enumerate() {
        stmt.execute(params![i as i64, id])?;
    }
    Ok(())
}

impl Store {
    /// Flip the pin flag, returning the new state.
    pub fn toggle_pin(&self, id: &str) -> Result<bool, FlashError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let pinned: bool = tx
            .query_row(
                "SELECT is_pinned FROM buffers WHERE id = ?1 AND is_archived = 0",
                [id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| FlashError::NotFound(id.to_string()))?;

        if pinned {
            // back to the top of the unpinned list
            tx.execute(
                &format!(
                    "UPDATE buffers SET is_pinned = 0, sort_order = {NEXT_TOP_SORT_ORDER} WHERE id = ?1"
                ),
                [id],
            )?;
        } else {
            tx.execute("UPDATE buffers SET is_pinned = 1 WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        debug!(id = %id, pinned = !pinned, "toggled pin");
        Ok(!pinned)
    }

    /// Apply a client ordering of the unpinned buffers. All or nothing.
    pub fn reorder(&self, ids: &[String]) -> Result<(), FlashError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = unpinned_ids(&tx)?;
        let merged = merge_order(&current, ids);
        renumber(&tx, &merged)?;
        tx.commit()?;
        debug!(requested = ids.len(), count = merged.len(), "reordered buffers");
        Ok(())
    }

    /// Swap with the display neighbour. False when there is nothing to swap
    /// with: unknown or pinned id, list edge, or a pinned neighbour.
    pub fn move_buffer(&self, id: &str, direction: Direction) -> Result<bool, FlashError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut order = unpinned_ids(&tx)?;

        let Some(pos) = order.iter().position(|x| x == id) else {
            return Ok(false);
        };
        let neighbour = match direction {
            Direction::Up if pos > 0 => pos - 1,
            Direction::Down if pos + 1 < order.len() => pos + 1,
            _ => return Ok(false),
        };

        let sort_of = |id: &str| -> rusqlite::Result<i64> {
            tx.query_row("SELECT sort_order FROM buffers WHERE id = ?1", [id], |r| r.get(0))
        };
        let a = sort_of(&order[pos])?;
        let b = sort_of(&order[neighbour])?;
        if a == b {
            order.swap(pos, neighbour);
            renumber(&tx, &order)?;
        } else {
            tx.execute(
                "UPDATE buffers SET sort_order = ?1 WHERE id = ?2",
                params![b, order[pos]],
            )?;
            tx.execute(
                "UPDATE buffers SET sort_order = ?1 WHERE id = ?2",
                params![a, order[neighbour]],
            )?;
        }
        tx.commit()?;
        debug!(id = %id, ?direction, "moved buffer");
        Ok(true)
    }
}
