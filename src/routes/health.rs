//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health`: liveness check.
///
/// Returns status, uptime, version and the upstream session, channel and
/// warm state. Always 200: an upstream outage is reported, not failed.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let snapshot = state.session.snapshot().await;
    let warm = state.warm.status().await;

    let channel = if state.session.event_stream_enabled() {
        match &snapshot.channel {
            Some(handle) => json!({
                "connected": handle.channel.is_connected(),
                "ready": handle.channel.is_ready(),
                "current": handle.generation == snapshot.generation,
                "accessories": handle.channel.accessory_count(),
            }),
            None => json!({ "connected": false, "ready": false, "accessories": 0 }),
        }
    } else {
        json!(null)
    };

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "groups": state.registry.len(),
        "session": {
            "authenticated": snapshot.token.is_some(),
            "generation": snapshot.generation,
            "last_refresh_secs_ago": snapshot.last_refresh.map(|t| t.elapsed().as_secs()),
            "last_error": snapshot.last_error,
        },
        "event_stream": channel,
        "warm": warm,
    }))
}
