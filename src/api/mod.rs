use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use crate::error::FlashError;
use crate::{db, db_call, AppState};

mod buffers;
mod settings;

use buffers::*;
use settings::{get_settings, set_setting};

// Largest buffer plus JSON escaping headroom.
const BODY_LIMIT: usize = 10 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/buffers", post(create_buffer).get(list_buffers))
        .route("/buffers/reorder", post(reorder_buffers))
        .route("/buffers/cleanup", post(cleanup_buffers))
        .route(
            "/buffers/{id}",
            get(get_buffer).put(save_buffer).delete(delete_buffer),
        )
        .route("/buffers/{id}/pin", post(toggle_pin))
        .route("/buffers/{id}/archive", post(archive_buffer))
        .route("/buffers/{id}/move", post(move_buffer))
        .route("/search", get(search_buffers))
        .route("/settings", get(get_settings))
        .route("/settings/{key}", put(set_setting))
        .route("/backup", post(do_backup))
        .route("/repair", post(do_repair))
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .with_state(state)
}

/// GET /health: counts, index integrity, size, uptime.
async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, FlashError> {
    let (integrity, active, db_size_bytes) = db_call(&state.store, |s| {
        Ok::<_, FlashError>((s.integrity()?, s.count(false)?, s.db_size_bytes()?))
    })
    .await??;
    let last_backup_ms = state.data_dir.as_deref().and_then(db::backup::last_backup_ms);

    Ok(Json(serde_json::json!({
        "name": "flashnotes",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "db_size_bytes": db_size_bytes,
        "buffers": active,
        "last_backup_ms": last_backup_ms,
        "integrity": integrity,
    })))
}

/// POST /backup: snapshot now, then prune old backups.
async fn do_backup(State(state): State<AppState>) -> Result<Json<serde_json::Value>, FlashError> {
    let Some(dir) = state.data_dir.clone() else {
        return Err(FlashError::Validation("in-memory store has no backup directory".into()));
    };
    let keep = state.max_backups;
    let path = db_call(&state.store, move |s| s.create_backup(&dir, keep)).await??;
    Ok(Json(serde_json::json!({ "path": path.display().to_string() })))
}

/// POST /repair: rebuild the full-text index from buffer content.
async fn do_repair(State(state): State<AppState>) -> Result<Json<serde_json::Value>, FlashError> {
    let indexed = db_call(&state.store, |s| s.rebuild_index()).await??;
    info!(indexed, "index repaired via api");
    Ok(Json(serde_json::json!({ "indexed": indexed })))
}
