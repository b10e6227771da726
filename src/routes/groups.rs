//! `GET /lightgroups` — the configured groups.

use axum::{extract::State, Json};
use indexmap::IndexMap;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct GroupsResponse {
    message: &'static str,
    #[serde(rename = "lightGroups")]
    light_groups: IndexMap<String, Vec<String>>,
}

/// Returns every group id with its device UUIDs, in config-file order.
///
/// Serialized straight from the `IndexMap`; going through `serde_json::Value`
/// would sort the keys.
pub async fn list_groups(State(state): State<AppState>) -> Json<GroupsResponse> {
    Json(GroupsResponse {
        message: "💡 Available light groups",
        light_groups: state.registry.groups().clone(),
    })
}
