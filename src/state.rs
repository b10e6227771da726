//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::registry::GroupRegistry;
use crate::session::SessionManager;
use crate::warm::WarmTracker;

/// Shared application state for the relay.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub registry: Arc<GroupRegistry>,
    /// Upstream token and event-stream channel.
    pub session: Arc<SessionManager>,
    pub warm: Arc<WarmTracker>,
    pub dispatcher: Arc<Dispatcher>,
}
