//! In-memory fakes for the upstream traits, shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AuthError, TransportError, UpstreamError};
use crate::upstream::{ChannelConnector, EventChannel, HomebridgeApi};

#[derive(Debug, Clone, PartialEq)]
pub struct SetCall {
    pub token: String,
    pub device: String,
    pub value: Value,
}

/// Scriptable Homebridge REST API. Logins hand out `token-1`, `token-2`, ...
pub struct FakeApi {
    pub login_ok: AtomicBool,
    pub logins: AtomicUsize,
    pub lists: AtomicUsize,
    list_failure: Mutex<Option<u16>>,
    set_failures: Mutex<HashMap<String, VecDeque<u16>>>,
    set_delays: Mutex<HashMap<String, Duration>>,
    sets: Mutex<Vec<SetCall>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            login_ok: AtomicBool::new(true),
            logins: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            list_failure: Mutex::new(None),
            set_failures: Mutex::new(HashMap::new()),
            set_delays: Mutex::new(HashMap::new()),
            sets: Mutex::new(Vec::new()),
        }
    }

    /// The next control calls for `device` fail with these statuses, in order.
    pub fn fail_sets(&self, device: &str, statuses: &[u16]) {
        self.set_failures
            .lock()
            .unwrap()
            .entry(device.to_string())
            .or_default()
            .extend(statuses);
    }

    /// Control calls for `device` take `delay` before answering.
    pub fn delay_sets(&self, device: &str, delay: Duration) {
        self.set_delays
            .lock()
            .unwrap()
            .insert(device.to_string(), delay);
    }

    pub fn fail_lists(&self, status: Option<u16>) {
        *self.list_failure.lock().unwrap() = status;
    }

    pub fn sets(&self) -> Vec<SetCall> {
        self.sets.lock().unwrap().clone()
    }

    pub fn sets_for(&self, device: &str) -> usize {
        self.sets().iter().filter(|c| c.device == device).count()
    }

    /// Login, listing and control calls combined.
    pub fn network_calls(&self) -> usize {
        self.logins.load(Ordering::SeqCst) + self.lists.load(Ordering::SeqCst) + self.sets().len()
    }
}

fn status_error(call: &str, status: u16) -> UpstreamError {
    UpstreamError::Status {
        call: call.to_string(),
        status,
        message: format!("fake status {status}"),
        data: None,
    }
}

#[async_trait]
impl HomebridgeApi for FakeApi {
    async fn login(&self) -> Result<String, AuthError> {
        if !self.login_ok.load(Ordering::SeqCst) {
            return Err(AuthError::Login(status_error("POST /api/auth/login", 401)));
        }
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("token-{n}"))
    }

    async fn list_accessories(&self, _token: &str) -> Result<Vec<Value>, UpstreamError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        match *self.list_failure.lock().unwrap() {
            Some(status) => Err(status_error("GET /api/accessories", status)),
            None => Ok(Vec::new()),
        }
    }

    async fn set_characteristic(
        &self,
        token: &str,
        unique_id: &str,
        _characteristic: &str,
        value: Value,
    ) -> Result<(), UpstreamError> {
        self.sets.lock().unwrap().push(SetCall {
            token: token.to_string(),
            device: unique_id.to_string(),
            value,
        });
        let delay = self.set_delays.lock().unwrap().get(unique_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .set_failures
            .lock()
            .unwrap()
            .get_mut(unique_id)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(status) => Err(status_error(
                &format!("PUT /api/accessories/{unique_id}"),
                status,
            )),
            None => Ok(()),
        }
    }
}

/// Event-stream channel whose state is flipped directly by tests.
pub struct FakeChannel {
    pub token: String,
    pub connected: AtomicBool,
    pub ready: AtomicBool,
    pub warm_ok: AtomicBool,
    pub fail_sends: AtomicBool,
    pub closed: AtomicBool,
    pub warms: AtomicUsize,
    pub accessories: AtomicUsize,
    sends: Mutex<Vec<(String, Value)>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeChannel {
    pub fn sends(&self) -> Vec<(String, Value)> {
        self.sends.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventChannel for FakeChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.is_connected() && self.ready.load(Ordering::SeqCst)
    }

    fn accessory_count(&self) -> usize {
        self.accessories.load(Ordering::SeqCst)
    }

    async fn warm(&self, timeout: Duration) -> Result<(), TransportError> {
        self.warms.fetch_add(1, Ordering::SeqCst);
        if self.warm_ok.load(Ordering::SeqCst) {
            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(TransportError::ReadyTimeout(
                u64::try_from(timeout.as_millis()).unwrap(),
            ))
        }
    }

    async fn set_characteristic(
        &self,
        unique_id: &str,
        _characteristic: &str,
        value: Value,
    ) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("fake send failure".into()));
        }
        self.sends
            .lock()
            .unwrap()
            .push((unique_id.to_string(), value));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("close {}", self.token));
    }
}

/// Hands out [`FakeChannel`]s and records every connect and close.
pub struct FakeConnector {
    pub connects: AtomicUsize,
    pub fail: AtomicBool,
    /// Applied to channels created afterwards.
    pub ready_on_connect: AtomicBool,
    pub warm_ok: AtomicBool,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            ready_on_connect: AtomicBool::new(false),
            warm_ok: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn last(&self) -> Option<Arc<FakeChannel>> {
        self.channels.lock().unwrap().last().cloned()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.token.clone())
            .collect()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(&self, token: &str) -> Result<Arc<dyn EventChannel>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("connect {token}"));
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("fake connect failure".into()));
        }
        let channel = Arc::new(FakeChannel {
            token: token.to_string(),
            connected: AtomicBool::new(true),
            ready: AtomicBool::new(self.ready_on_connect.load(Ordering::SeqCst)),
            warm_ok: AtomicBool::new(self.warm_ok.load(Ordering::SeqCst)),
            fail_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            warms: AtomicUsize::new(0),
            accessories: AtomicUsize::new(0),
            sends: Mutex::new(Vec::new()),
            log: Arc::clone(&self.log),
        });
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        Ok(channel)
    }
}
