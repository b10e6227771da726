//! Session manager. Owns the upstream token and the event-stream channel.
//!
//! The token is replaced only by a successful login, which also bumps the
//! session *generation*. Every event-stream channel is tagged with the
//! generation it was opened under; a channel from an older generation is
//! never used for control, so a command racing a refresh either goes out on
//! a channel that matches the current token or falls back to REST.
//!
//! All writers (refresh, channel replacement) are serialized by an async
//! mutex. Readers take cheap snapshot copies under a short-held `RwLock`.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AuthError, TransportError};
use crate::upstream::{ChannelConnector, EventChannel, HomebridgeApi};

/// An event-stream channel together with the session generation it belongs to.
#[derive(Clone)]
pub struct ChannelHandle {
    pub generation: u64,
    pub channel: Arc<dyn EventChannel>,
}

/// Point-in-time copy of the session.
#[derive(Clone)]
pub struct SessionSnapshot {
    pub token: Option<String>,
    pub generation: u64,
    pub channel: Option<ChannelHandle>,
    pub last_refresh: Option<Instant>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct SessionInner {
    token: Option<String>,
    generation: u64,
    channel: Option<ChannelHandle>,
    last_refresh: Option<Instant>,
    last_error: Option<String>,
}

pub struct SessionManager {
    api: Arc<dyn HomebridgeApi>,
    /// `None` when the event stream is disabled in config.
    connector: Option<Arc<dyn ChannelConnector>>,
    inner: RwLock<SessionInner>,
    writer: Mutex<()>,
    refresh_requested: Notify,
}

impl SessionManager {
    pub fn new(api: Arc<dyn HomebridgeApi>, connector: Option<Arc<dyn ChannelConnector>>) -> Self {
        Self {
            api,
            connector,
            inner: RwLock::new(SessionInner::default()),
            writer: Mutex::new(()),
            refresh_requested: Notify::new(),
        }
    }

    pub fn event_stream_enabled(&self) -> bool {
        self.connector.is_some()
    }

    /// Log in again and replace the token.
    ///
    /// On success the generation is bumped, the old channel is closed and a
    /// new one is opened with the new token. A connect failure is logged and
    /// leaves the session without a channel. On login failure the previous
    /// token stays in place.
    pub async fn refresh_session(&self) -> Result<String, AuthError> {
        let _writer = self.writer.lock().await;

        let token = match self.api.login().await {
            Ok(token) => token,
            Err(e) => {
                let mut inner = self.inner.write().await;
                inner.last_error = Some(e.to_string());
                warn!(
                    generation = inner.generation,
                    has_token = inner.token.is_some(),
                    detail = %e.detail(),
                    "Session refresh failed: {e}"
                );
                return Err(e);
            }
        };

        let (generation, old) = {
            let mut inner = self.inner.write().await;
            inner.token = Some(token.clone());
            inner.generation += 1;
            inner.last_refresh = Some(Instant::now());
            inner.last_error = None;
            (inner.generation, inner.channel.take())
        };
        info!(generation, "Session token refreshed");

        if let Some(old) = old {
            debug!(generation = old.generation, "Closing event stream of previous session");
            old.channel.close().await;
        }

        if let Some(connector) = &self.connector {
            match connector.connect(&token).await {
                Ok(channel) => {
                    self.inner.write().await.channel = Some(ChannelHandle {
                        generation,
                        channel,
                    });
                    info!(generation, "Event stream connected");
                }
                Err(e) => warn!(
                    generation,
                    detail = %e.detail(),
                    "Event stream connect failed, using REST"
                ),
            }
        }

        Ok(token)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.read().await;
        SessionSnapshot {
            token: inner.token.clone(),
            generation: inner.generation,
            channel: inner.channel.clone(),
            last_refresh: inner.last_refresh,
            last_error: inner.last_error.clone(),
        }
    }

    pub async fn token(&self) -> Option<String> {
        self.inner.read().await.token.clone()
    }

    pub async fn generation(&self) -> u64 {
        self.inner.read().await.generation
    }

    pub async fn is_current(&self, generation: u64) -> bool {
        self.inner.read().await.generation == generation
    }

    /// The channel to prefer for control: opened under the current
    /// generation, connected and ready for control.
    pub async fn preferred_channel(&self) -> Option<ChannelHandle> {
        let inner = self.inner.read().await;
        inner
            .channel
            .as_ref()
            .filter(|h| {
                h.generation == inner.generation && h.channel.is_connected() && h.channel.is_ready()
            })
            .cloned()
    }

    /// Reuse the connected channel of the current generation or open a new one.
    pub async fn ensure_channel(&self) -> Result<ChannelHandle, TransportError> {
        let Some(connector) = &self.connector else {
            return Err(TransportError::Disabled);
        };

        if let Some(handle) = self.live_channel().await {
            return Ok(handle);
        }

        let _writer = self.writer.lock().await;

        // A refresh may have connected while we waited for the writer lock.
        if let Some(handle) = self.live_channel().await {
            return Ok(handle);
        }

        let (token, generation, old) = {
            let mut inner = self.inner.write().await;
            let Some(token) = inner.token.clone() else {
                return Err(TransportError::NoSession);
            };
            (token, inner.generation, inner.channel.take())
        };

        if let Some(old) = old {
            old.channel.close().await;
        }

        let channel = connector.connect(&token).await?;
        let handle = ChannelHandle {
            generation,
            channel,
        };
        self.inner.write().await.channel = Some(handle.clone());
        info!(generation, "Event stream reconnected");
        Ok(handle)
    }

    async fn live_channel(&self) -> Option<ChannelHandle> {
        let inner = self.inner.read().await;
        inner
            .channel
            .as_ref()
            .filter(|h| h.generation == inner.generation && h.channel.is_connected())
            .cloned()
    }

    /// Ask the refresh task to log in again before its next tick.
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Resolves when [`request_refresh`](Self::request_refresh) was called.
    pub async fn refresh_requested(&self) {
        self.refresh_requested.notified().await;
    }

    pub async fn shutdown(&self) {
        let _writer = self.writer.lock().await;
        let channel = self.inner.write().await.channel.take();
        if let Some(handle) = channel {
            handle.channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::{FakeApi, FakeConnector};

    fn manager(api: &Arc<FakeApi>, connector: Option<&Arc<FakeConnector>>) -> SessionManager {
        SessionManager::new(
            api.clone(),
            connector.map(|c| c.clone() as Arc<dyn ChannelConnector>),
        )
    }

    #[tokio::test]
    async fn refresh_bumps_generation_and_opens_channel() {
        let api = Arc::new(FakeApi::new());
        let connector = Arc::new(FakeConnector::new());
        let session = manager(&api, Some(&connector));

        let token = session.refresh_session().await.unwrap();
        let snap = session.snapshot().await;
        assert_eq!(snap.token.as_deref(), Some(token.as_str()));
        assert_eq!(snap.generation, 1);
        assert_eq!(snap.channel.unwrap().generation, 1);
        assert_eq!(connector.tokens(), vec![token]);
    }

    #[tokio::test]
    async fn old_channel_is_closed_before_replacement_connects() {
        let api = Arc::new(FakeApi::new());
        let connector = Arc::new(FakeConnector::new());
        let session = manager(&api, Some(&connector));

        session.refresh_session().await.unwrap();
        session.refresh_session().await.unwrap();

        assert_eq!(
            connector.log(),
            vec!["connect token-1", "close token-1", "connect token-2"]
        );
        assert_eq!(session.generation().await, 2);
        assert!(session.is_current(2).await);
        assert!(!session.is_current(1).await);
    }

    #[tokio::test]
    async fn failed_login_keeps_stale_token() {
        let api = Arc::new(FakeApi::new());
        let session = manager(&api, None);

        session.refresh_session().await.unwrap();
        api.login_ok.store(false, Ordering::SeqCst);
        assert!(session.refresh_session().await.is_err());

        let snap = session.snapshot().await;
        assert_eq!(snap.token.as_deref(), Some("token-1"));
        assert_eq!(snap.generation, 1);
        assert!(snap.last_error.is_some());
    }

    #[tokio::test]
    async fn connect_failure_leaves_token_usable() {
        let api = Arc::new(FakeApi::new());
        let connector = Arc::new(FakeConnector::new());
        connector.fail.store(true, Ordering::SeqCst);
        let session = manager(&api, Some(&connector));

        session.refresh_session().await.unwrap();
        assert_eq!(session.token().await.as_deref(), Some("token-1"));
        assert!(session.snapshot().await.channel.is_none());
        assert!(session.preferred_channel().await.is_none());
    }

    #[tokio::test]
    async fn preferred_channel_requires_ready() {
        let api = Arc::new(FakeApi::new());
        let connector = Arc::new(FakeConnector::new());
        let session = manager(&api, Some(&connector));
        session.refresh_session().await.unwrap();

        assert!(session.preferred_channel().await.is_none());
        connector.last().unwrap().ready.store(true, Ordering::SeqCst);
        assert!(session.preferred_channel().await.is_some());
    }

    #[tokio::test]
    async fn ensure_channel_reuses_live_channel() {
        let api = Arc::new(FakeApi::new());
        let connector = Arc::new(FakeConnector::new());
        let session = manager(&api, Some(&connector));
        session.refresh_session().await.unwrap();

        session.ensure_channel().await.unwrap();
        session.ensure_channel().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ensure_channel_replaces_dropped_channel() {
        let api = Arc::new(FakeApi::new());
        let connector = Arc::new(FakeConnector::new());
        let session = manager(&api, Some(&connector));
        session.refresh_session().await.unwrap();

        connector.last().unwrap().connected.store(false, Ordering::SeqCst);
        let handle = session.ensure_channel().await.unwrap();
        assert_eq!(handle.generation, 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ensure_channel_without_token_or_connector() {
        let api = Arc::new(FakeApi::new());
        let connector = Arc::new(FakeConnector::new());
        let session = manager(&api, Some(&connector));
        assert!(matches!(
            session.ensure_channel().await,
            Err(TransportError::NoSession)
        ));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);

        let disabled = manager(&api, None);
        assert!(matches!(
            disabled.ensure_channel().await,
            Err(TransportError::Disabled)
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_channel() {
        let api = Arc::new(FakeApi::new());
        let connector = Arc::new(FakeConnector::new());
        let session = manager(&api, Some(&connector));
        session.refresh_session().await.unwrap();

        session.shutdown().await;
        assert!(connector.last().unwrap().closed.load(Ordering::SeqCst));
        assert!(session.snapshot().await.channel.is_none());
    }
}
