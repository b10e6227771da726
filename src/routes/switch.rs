//! Light-group switching endpoints.
//!
//! - `GET /switch/on?switch=<groupId>`
//! - `GET /switch/off?switch=<groupId>`
//!
//! A known group always answers 200, even when some devices failed; the
//! per-device outcome is in `details`. Missing or unknown groups answer 400.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::dispatch::ControlResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SwitchQuery {
    pub switch: Option<String>,
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

pub async fn switch_on(State(state): State<AppState>, Query(query): Query<SwitchQuery>) -> ApiResult {
    set_group(&state, query, true).await
}

pub async fn switch_off(
    State(state): State<AppState>,
    Query(query): Query<SwitchQuery>,
) -> ApiResult {
    set_group(&state, query, false).await
}

async fn set_group(state: &AppState, query: SwitchQuery, on: bool) -> ApiResult {
    let Some(group) = query.switch.filter(|s| !s.is_empty()) else {
        return Err(bad_request("Missing switch parameter".to_string()));
    };
    let (verb, marker) = if on { ("on", "🟢") } else { ("off", "🔴") };
    info!(group = %group, "Switch {verb} requested");

    let results = state
        .dispatcher
        .set_group_state(&group, on)
        .await
        .map_err(|e| bad_request(e.to_string()))?;

    let details: Vec<String> = results.iter().map(ControlResult::message).collect();
    Ok(Json(json!({
        "message": format!("{marker} Light group {group} turned {verb}"),
        "details": details,
    })))
}

fn bad_request(error: String) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": error })))
}
