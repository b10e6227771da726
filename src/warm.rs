//! Warm-state tracking for the Homebridge accessory cache.
//!
//! Homebridge only accepts control commands for accessories it has loaded.
//! A warm-up asks it to (re)load them, preferably over the event stream
//! (`get-layout` + `get-accessories`, then wait for
//! `accessories-ready-for-control`), else by listing accessories over REST.
//! The cache counts as cold after `timing.warm_stale_secs`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TimingConfig;
use crate::error::{TransportError, WarmError};
use crate::session::SessionManager;
use crate::upstream::HomebridgeApi;

/// How a warm-up completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmPath {
    /// Fresh enough; no network calls were made.
    AlreadyWarm,
    EventStream,
    Rest,
}

/// Warm state as reported by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct WarmStatus {
    pub warm: bool,
    pub last_warmed_secs_ago: Option<u64>,
    pub channel_ready: bool,
}

pub struct WarmTracker {
    session: Arc<SessionManager>,
    api: Arc<dyn HomebridgeApi>,
    stale_after: Duration,
    ready_timeout: Duration,
    last_warmed: Mutex<Option<Instant>>,
}

impl WarmTracker {
    pub fn new(
        session: Arc<SessionManager>,
        api: Arc<dyn HomebridgeApi>,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            session,
            api,
            stale_after: timing.warm_stale(),
            ready_timeout: timing.ready_timeout(),
            last_warmed: Mutex::new(None),
        }
    }

    /// Warm up unless the cache is fresh and (when the event stream is in
    /// use) a ready channel exists.
    pub async fn ensure_warm(&self) -> Result<WarmPath, WarmError> {
        let channel_ok = !self.session.event_stream_enabled()
            || self.session.preferred_channel().await.is_some();
        if self.is_fresh() && channel_ok {
            return Ok(WarmPath::AlreadyWarm);
        }
        self.warm_now().await
    }

    /// Run one warm cycle regardless of the current state.
    pub async fn warm_now(&self) -> Result<WarmPath, WarmError> {
        let Some(token) = self.session.token().await else {
            return Err(WarmError::NoSession);
        };

        if self.session.event_stream_enabled() {
            match self.warm_via_channel().await {
                Ok(()) => {
                    self.mark_warm();
                    debug!("Accessory cache warmed via event stream");
                    return Ok(WarmPath::EventStream);
                }
                Err(e) => warn!(
                    detail = %e.detail(),
                    "Event stream warm-up failed, listing over REST"
                ),
            }
        }

        match self.api.list_accessories(&token).await {
            Ok(accessories) => {
                self.mark_warm();
                info!(count = accessories.len(), "Accessory cache warmed via REST");
                Ok(WarmPath::Rest)
            }
            Err(e) => {
                if e.is_unauthorized() {
                    self.session.request_refresh();
                }
                Err(e.into())
            }
        }
    }

    async fn warm_via_channel(&self) -> Result<(), TransportError> {
        let handle = self.session.ensure_channel().await?;
        handle.channel.warm(self.ready_timeout).await
    }

    fn mark_warm(&self) {
        *self.lock_last_warmed() = Some(Instant::now());
    }

    fn is_fresh(&self) -> bool {
        let last = *self.lock_last_warmed();
        last.is_some_and(|at| at.elapsed() <= self.stale_after)
    }

    fn lock_last_warmed(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_warmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn status(&self) -> WarmStatus {
        let last = *self.lock_last_warmed();
        WarmStatus {
            warm: self.is_fresh(),
            last_warmed_secs_ago: last.map(|at| at.elapsed().as_secs()),
            channel_ready: self.session.preferred_channel().await.is_some(),
        }
    }
}
