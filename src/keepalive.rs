//! Background keepalive tasks.
//!
//! - **refresher** — logs in again every `timing.token_refresh_secs`, or
//!   early when an upstream call answered 401 (but not within 10 s of the
//!   last refresh), then warms the cache.
//! - **warmer** — unconditional warm-up every `timing.warmup_interval_secs`.
//!
//! Both run until [`Keepalive::shutdown`] cancels them. Neither ever ends the
//! process: failures are logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TimingConfig;
use crate::session::SessionManager;
use crate::warm::WarmTracker;

/// Refresh the session and, if that worked, warm the accessory cache.
/// Returns whether the refresh succeeded.
pub async fn refresh_and_warm(session: &SessionManager, warm: &WarmTracker) -> bool {
    if session.refresh_session().await.is_err() {
        // Already logged by the session manager; the previous token stays.
        return false;
    }
    match warm.warm_now().await {
        Ok(path) => debug!(?path, "Post-refresh warm-up done"),
        Err(e) => warn!("Post-refresh warm-up failed: {e}"),
    }
    true
}

pub struct Keepalive {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Keepalive {
    pub fn spawn(
        session: Arc<SessionManager>,
        warm: Arc<WarmTracker>,
        timing: &TimingConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let refresher = tokio::spawn(refresh_loop(
            Arc::clone(&session),
            Arc::clone(&warm),
            timing.token_refresh(),
            cancel.clone(),
        ));
        let warmer = tokio::spawn(warm_loop(warm, timing.warmup_interval(), cancel.clone()));
        Self {
            cancel,
            handles: vec![refresher, warmer],
        }
    }

    /// Cancel both tasks and wait for them to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Early refresh requests closer than this to the last refresh are dropped.
/// The post-refresh warm-up can itself answer 401 and request another one.
const EARLY_REFRESH_MIN_GAP: Duration = Duration::from_secs(10);

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn refresh_loop(
    session: Arc<SessionManager>,
    warm: Arc<WarmTracker>,
    period: Duration,
    cancel: CancellationToken,
) {
    let min_gap = EARLY_REFRESH_MIN_GAP.min(period);
    let mut interval = ticker(period);
    let mut last_refresh: Option<Instant> = None;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
            () = session.refresh_requested() => {
                if last_refresh.is_some_and(|at| at.elapsed() < min_gap) {
                    debug!("Early session refresh dropped, last refresh was too recent");
                    continue;
                }
                info!("Early session refresh requested");
                interval.reset();
            }
        }
        refresh_and_warm(&session, &warm).await;
        last_refresh = Some(Instant::now());
    }
    debug!("Session refresher stopped");
}

async fn warm_loop(warm: Arc<WarmTracker>, period: Duration, cancel: CancellationToken) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match warm.warm_now().await {
            Ok(path) => debug!(?path, "Periodic warm-up done"),
            Err(e) => warn!("Periodic warm-up failed: {e}"),
        }
    }
    debug!("Warmer stopped");
}
