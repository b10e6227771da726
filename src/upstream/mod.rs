//! Transports to the Homebridge UI server.
//!
//! - [`client`] — request/response channel (REST, bearer token per call)
//! - [`socket`] — event-stream channel (Socket.IO over WebSocket, token in the
//!   connection URL)
//! - [`frame`] — Engine.IO / Socket.IO text-frame codec used by [`socket`]
//!
//! The session, warm-up and dispatch layers only see the traits below, so the
//! retry policy can be exercised without a network.

pub mod client;
pub mod frame;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AuthError, TransportError, UpstreamError};

pub use client::HomebridgeClient;
pub use socket::{SocketIoChannel, SocketIoConnector};

/// HomeKit characteristic switched by the relay.
pub const ON_CHARACTERISTIC: &str = "On";

/// Which channel carried a control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    EventStream,
    Rest,
}

impl Transport {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::EventStream => "WS",
            Self::Rest => "HTTP",
        }
    }
}

/// Request/response calls against the Homebridge REST API.
#[async_trait]
pub trait HomebridgeApi: Send + Sync {
    /// `POST /api/auth/login` with the configured credentials.
    async fn login(&self) -> Result<String, AuthError>;

    /// `GET /api/accessories`. Listing is also what warms the accessory cache.
    async fn list_accessories(&self, token: &str) -> Result<Vec<Value>, UpstreamError>;

    /// `PUT /api/accessories/{unique_id}`.
    async fn set_characteristic(
        &self,
        token: &str,
        unique_id: &str,
        characteristic: &str,
        value: Value,
    ) -> Result<(), UpstreamError>;
}

/// A live event-stream connection, opened for exactly one session token.
#[async_trait]
pub trait EventChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Connected and the upstream has announced `accessories-ready-for-control`.
    fn is_ready(&self) -> bool;

    /// Accessories listed by the last `accessories-data` event.
    fn accessory_count(&self) -> usize;

    /// Ask for the layout and accessory list, then wait for a fresh
    /// ready-for-control signal.
    async fn warm(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Fire-and-forget control message.
    async fn set_characteristic(
        &self,
        unique_id: &str,
        characteristic: &str,
        value: Value,
    ) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Opens event-stream channels for a given token.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Arc<dyn EventChannel>, TransportError>;
}
