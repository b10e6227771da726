//! Command dispatcher: switches every device of a light group.
//!
//! Each device runs its own small retry state machine:
//!
//! ```text
//! TryPreferred ──ok──────────────────────────────▶ Finished(success, WS)
//!      │ not preferred / transport error
//!      ▼
//! TryFallback ──ok───────────────────────────────▶ Finished(success, HTTP)
//!      │ 400/404 (accessory not loaded)   other ─▶ Finished(failure)
//!      ▼
//! WarmAndRetryFallback ──ok──────────────────────▶ Finished(success, HTTP, after retry)
//!                      └─err─────────────────────▶ Finished(failure)
//! ```
//!
//! Devices are switched concurrently; one device failing never affects its
//! siblings.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, ErrorDetail, TransportError, UpstreamError};
use crate::registry::GroupRegistry;
use crate::session::{ChannelHandle, SessionManager};
use crate::upstream::{HomebridgeApi, Transport, ON_CHARACTERISTIC};
use crate::warm::WarmTracker;

/// Outcome of switching one device.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    Success { via: Transport, after_retry: bool },
    Failure { detail: ErrorDetail },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlResult {
    pub device_id: String,
    pub on: bool,
    pub outcome: ControlOutcome,
}

impl ControlResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ControlOutcome::Success { .. })
    }

    /// Human-readable line for the HTTP response.
    pub fn message(&self) -> String {
        match &self.outcome {
            ControlOutcome::Success { via, after_retry } => {
                let state = if self.on { "on" } else { "off" };
                let suffix = if *after_retry {
                    " (after warmup retry)"
                } else {
                    ""
                };
                format!(
                    "Lamp with UUID {} turned {state} successfully via {}{suffix}",
                    self.device_id,
                    via.label()
                )
            }
            ControlOutcome::Failure { detail } => {
                format!("Failed to control lamp with UUID {}: {detail}", self.device_id)
            }
        }
    }
}

enum Step {
    TryPreferred,
    TryFallback,
    WarmAndRetryFallback,
    Finished(ControlOutcome),
}

/// Why a REST control attempt failed.
enum RestFailure {
    NoSession(String),
    Upstream(UpstreamError),
}

impl RestFailure {
    fn is_cold_cache(&self) -> bool {
        matches!(self, Self::Upstream(e) if e.is_cold_cache())
    }

    fn detail(&self) -> ErrorDetail {
        match self {
            Self::NoSession(call) => ErrorDetail::local(call.as_str(), "NO_SESSION", "no session token"),
            Self::Upstream(e) => e.detail(),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<GroupRegistry>,
    session: Arc<SessionManager>,
    warm: Arc<WarmTracker>,
    api: Arc<dyn HomebridgeApi>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<GroupRegistry>,
        session: Arc<SessionManager>,
        warm: Arc<WarmTracker>,
        api: Arc<dyn HomebridgeApi>,
    ) -> Self {
        Self {
            registry,
            session,
            warm,
            api,
        }
    }

    /// Switch every device of `group_id`. Results are in configured device order.
    pub async fn set_group_state(
        &self,
        group_id: &str,
        on: bool,
    ) -> Result<Vec<ControlResult>, DispatchError> {
        let devices = self.registry.resolve(group_id)?;

        match self.warm.ensure_warm().await {
            Ok(path) => debug!(group = group_id, ?path, "Warm check done"),
            Err(e) => warn!(group = group_id, "Warm-up before dispatch failed: {e}"),
        }

        let results = join_all(devices.iter().map(|d| self.control_device(d, on))).await;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        if failed == 0 {
            info!(group = group_id, on, devices = results.len(), "Light group switched");
        } else {
            warn!(
                group = group_id,
                on,
                devices = results.len(),
                failed,
                "Light group partially switched"
            );
        }
        Ok(results)
    }

    async fn control_device(&self, device_id: &str, on: bool) -> ControlResult {
        let mut step = Step::TryPreferred;
        loop {
            step = match step {
                Step::TryPreferred => match self.session.preferred_channel().await {
                    Some(handle) => match self.send_via_channel(&handle, device_id, on).await {
                        Ok(()) => Step::Finished(ControlOutcome::Success {
                            via: Transport::EventStream,
                            after_retry: false,
                        }),
                        Err(e) => {
                            debug!(
                                device = device_id,
                                detail = %e.detail(),
                                "Event stream send failed, using REST"
                            );
                            Step::TryFallback
                        }
                    },
                    None => Step::TryFallback,
                },
                Step::TryFallback => match self.send_via_rest(device_id, on).await {
                    Ok(()) => Step::Finished(ControlOutcome::Success {
                        via: Transport::Rest,
                        after_retry: false,
                    }),
                    Err(e) if e.is_cold_cache() => {
                        info!(device = device_id, "Accessory not loaded upstream, warming and retrying");
                        Step::WarmAndRetryFallback
                    }
                    Err(e) => Step::Finished(ControlOutcome::Failure { detail: e.detail() }),
                },
                Step::WarmAndRetryFallback => {
                    if let Err(e) = self.warm.warm_now().await {
                        warn!(device = device_id, "Forced warm-up failed: {e}");
                    }
                    match self.send_via_rest(device_id, on).await {
                        Ok(()) => Step::Finished(ControlOutcome::Success {
                            via: Transport::Rest,
                            after_retry: true,
                        }),
                        Err(e) => Step::Finished(ControlOutcome::Failure { detail: e.detail() }),
                    }
                }
                Step::Finished(outcome) => {
                    if let ControlOutcome::Failure { detail } = &outcome {
                        warn!(device = device_id, on, %detail, "Control failed");
                    }
                    return ControlResult {
                        device_id: device_id.to_string(),
                        on,
                        outcome,
                    };
                }
            };
        }
    }

    /// The channel must still belong to the current session at send time.
    async fn send_via_channel(
        &self,
        handle: &ChannelHandle,
        device_id: &str,
        on: bool,
    ) -> Result<(), TransportError> {
        if !self.session.is_current(handle.generation).await {
            return Err(TransportError::StaleGeneration {
                channel: handle.generation,
                current: self.session.generation().await,
            });
        }
        handle
            .channel
            .set_characteristic(device_id, ON_CHARACTERISTIC, Value::Bool(on))
            .await
    }

    async fn send_via_rest(&self, device_id: &str, on: bool) -> Result<(), RestFailure> {
        // Read at call time so a refresh that just finished is picked up.
        let Some(token) = self.session.token().await else {
            return Err(RestFailure::NoSession(format!(
                "PUT /api/accessories/{device_id}"
            )));
        };
        self.api
            .set_characteristic(&token, device_id, ON_CHARACTERISTIC, Value::Bool(on))
            .await
            .map_err(|e| {
                if e.is_unauthorized() {
                    self.session.request_refresh();
                }
                RestFailure::Upstream(e)
            })
    }
}
