//! HTTP client for the Homebridge UI REST endpoints.
//!
//! [`HomebridgeClient`] wraps `reqwest::Client` with a keep-alive pool and a
//! per-call timeout. The token is passed into every protected call rather
//! than stored here; the session manager owns it.
//!
//! ## Error handling
//!
//! Non-2xx responses become [`UpstreamError::Status`] carrying the `message`
//! (or `error`) field of the JSON body when present, else the raw body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};
use tracing::debug;

use super::HomebridgeApi;
use crate::config::{HomebridgeConfig, TimingConfig};
use crate::error::{AuthError, UpstreamError};

const LOGIN_CALL: &str = "POST /api/auth/login";
const LIST_CALL: &str = "GET /api/accessories";

/// HTTP client for one Homebridge instance.
pub struct HomebridgeClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

impl HomebridgeClient {
    pub fn new(config: &HomebridgeConfig, timing: &TimingConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timing.connect_timeout())
            .timeout(timing.request_timeout())
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(15))
            .tcp_keepalive(Duration::from_secs(10))
            .build()
            .map_err(|e| UpstreamError::from_reqwest("build HTTP client", e))?;
        Self::with_client(http, config)
    }

    /// Build around an existing `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        config: &HomebridgeConfig,
    ) -> Result<Self, UpstreamError> {
        // Strip trailing slash for consistent URL construction
        let trimmed = config.url.trim_end_matches('/');
        let base_url = Url::parse(trimmed).map_err(|e| UpstreamError::Decode {
            call: "parse homebridge.url".into(),
            message: e.to_string(),
        })?;
        Ok(Self {
            http,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// `base_url` + path segments, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Parse an HTTP response. Returns the JSON body on success (`Null` for
    /// an empty body), or an [`UpstreamError`] on failure.
    async fn handle_response(call: &str, resp: reqwest::Response) -> Result<Value, UpstreamError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| UpstreamError::from_reqwest(call, e))?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&body).map_err(|e| UpstreamError::Decode {
                call: call.to_string(),
                message: e.to_string(),
            })
        } else {
            let data = serde_json::from_str::<Value>(&body).ok();
            let message = data
                .as_ref()
                .and_then(|v| {
                    v["message"]
                        .as_str()
                        .or_else(|| v["error"].as_str())
                        .map(String::from)
                })
                .unwrap_or_else(|| body.clone());
            Err(UpstreamError::Status {
                call: call.to_string(),
                status: status.as_u16(),
                message,
                data,
            })
        }
    }
}

#[async_trait]
impl HomebridgeApi for HomebridgeClient {
    async fn login(&self) -> Result<String, AuthError> {
        let resp = self
            .http
            .post(self.url(&["api", "auth", "login"]))
            .json(&json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(LOGIN_CALL, e))?;
        let body = Self::handle_response(LOGIN_CALL, resp).await?;

        body["access_token"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(String::from)
            .ok_or(AuthError::MissingToken)
    }

    async fn list_accessories(&self, token: &str) -> Result<Vec<Value>, UpstreamError> {
        let resp = self
            .http
            .get(self.url(&["api", "accessories"]))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(LIST_CALL, e))?;
        match Self::handle_response(LIST_CALL, resp).await? {
            Value::Array(items) => Ok(items),
            other => {
                debug!(body = %other, "accessory listing was not an array");
                Ok(Vec::new())
            }
        }
    }

    async fn set_characteristic(
        &self,
        token: &str,
        unique_id: &str,
        characteristic: &str,
        value: Value,
    ) -> Result<(), UpstreamError> {
        let call = format!("PUT /api/accessories/{unique_id}");
        let resp = self
            .http
            .put(self.url(&["api", "accessories", unique_id]))
            .bearer_auth(token)
            .json(&json!({
                "characteristicType": characteristic,
                "value": value,
            }))
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&call, e))?;
        Self::handle_response(&call, resp).await.map(|_| ())
    }
}
