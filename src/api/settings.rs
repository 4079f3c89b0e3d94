use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::error::FlashError;
use crate::{db_call, AppState};

#[derive(Debug, Deserialize)]
pub(super) struct SettingBody {
    value: String,
}

pub(super) async fn get_settings(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, String>>, FlashError> {
    let settings = db_call(&state.store, |s| s.settings()).await??;
    Ok(Json(settings))
}

pub(super) async fn set_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(input): Json<SettingBody>,
) -> Result<Json<serde_json::Value>, FlashError> {
    let (k, v) = (key.clone(), input.value.clone());
    db_call(&state.store, move |s| s.set_setting(&k, &v)).await??;
    Ok(Json(serde_json::json!({ "key": key, "value": input.value })))
}
