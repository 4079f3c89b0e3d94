//! Buffer command handlers.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::db::{self, Direction};
use crate::error::FlashError;
use crate::{db_call, AppState};

#[derive(Debug, Default, Deserialize)]
pub(super) struct CreateBody {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SaveBody {
    content: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct PageQuery {
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SearchQuery {
    q: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ReorderBody {
    ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct CleanupBody {
    active_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct MoveBody {
    direction: Direction,
}

/// Optional JSON body: empty means defaults.
fn parse_optional<T: Default + serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, FlashError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| FlashError::Validation(format!("invalid body: {e}")))
}

pub(super) async fn create_buffer(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<db::BufferSummary>), FlashError> {
    let input: CreateBody = parse_optional(&body)?;
    let summary = db_call(&state.store, move |s| s.create(input.content.as_deref())).await??;
    Ok((StatusCode::CREATED, Json(summary)))
}

pub(super) async fn save_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SaveBody>,
) -> Result<Json<db::BufferMeta>, FlashError> {
    let meta = db_call(&state.store, move |s| s.save(&id, &input.content)).await??;
    Ok(Json(meta))
}

/// Opening a buffer counts as selecting it.
pub(super) async fn get_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, FlashError> {
    let open_id = id.clone();
    let content = db_call(&state.store, move |s| s.open_buffer(&open_id)).await??;
    Ok(Json(serde_json::json!({ "id": id, "content": content })))
}

pub(super) async fn list_buffers(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Vec<db::BufferSummary>>, FlashError> {
    let offset = q.offset.unwrap_or(0);
    let limit = q.limit.unwrap_or(db::DEFAULT_PAGE_SIZE);
    let page = db_call(&state.store, move |s| s.list_page(offset, limit)).await??;
    Ok(Json(page))
}

pub(super) async fn search_buffers(
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<db::SearchResult>>, FlashError> {
    let query = q.q.unwrap_or_default();
    let limit = q.limit.unwrap_or(db::DEFAULT_SEARCH_LIMIT);
    let results = db_call(&state.store, move |s| s.search(&query, limit)).await??;
    Ok(Json(results))
}

pub(super) async fn delete_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, FlashError> {
    let next = db_call(&state.store, move |s| s.delete(&id)).await??;
    Ok(Json(serde_json::json!({ "next_active_id": next })))
}

pub(super) async fn toggle_pin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, FlashError> {
    let pinned = db_call(&state.store, move |s| s.toggle_pin(&id)).await??;
    Ok(Json(serde_json::json!({ "is_pinned": pinned })))
}

pub(super) async fn archive_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, FlashError> {
    db_call(&state.store, move |s| s.archive(&id)).await??;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn move_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<MoveBody>,
) -> Result<Json<serde_json::Value>, FlashError> {
    let moved = db_call(&state.store, move |s| s.move_buffer(&id, input.direction)).await??;
    Ok(Json(serde_json::json!({ "moved": moved })))
}

pub(super) async fn reorder_buffers(
    State(state): State<AppState>,
    Json(input): Json<ReorderBody>,
) -> Result<Json<serde_json::Value>, FlashError> {
    db_call(&state.store, move |s| s.reorder(&input.ids)).await??;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn cleanup_buffers(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, FlashError> {
    let input: CleanupBody = parse_optional(&body)?;
    let removed = db_call(&state.store, move |s| s.cleanup_empty(input.active_id.as_deref())).await??;
    Ok(Json(serde_json::json!({ "removed": removed })))
}
