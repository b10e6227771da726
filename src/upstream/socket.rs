//! Event-stream channel: Socket.IO over WebSocket to the Homebridge UI.
//!
//! A [`SocketIoChannel`] is opened for one session token (passed as the
//! `token` query parameter, there is no header during the upgrade) and is
//! never re-authenticated in place. The session manager closes it and opens
//! a new one whenever the token changes.
//!
//! Besides carrying `accessory-control` messages, the channel listens for
//! `accessories-data` and `accessories-ready-for-control`; the latter is
//! what marks the channel usable for control and completes a warm-up.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{self, Frame, Packet, ACCESSORIES_NAMESPACE};
use super::{ChannelConnector, EventChannel};
use crate::error::TransportError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const OUTBOUND_CAPACITY: usize = 64;

/// Namespace link state as seen by the I/O loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Connecting,
    Connected,
    Closed(String),
}

/// State shared between the channel handle and its I/O loop.
struct Shared {
    connected: AtomicBool,
    ready: AtomicBool,
    /// Bumped on every `accessories-ready-for-control` event.
    ready_epoch: watch::Sender<u64>,
    link: watch::Sender<Link>,
    accessories: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            ready_epoch: watch::Sender::new(0),
            link: watch::Sender::new(Link::Connecting),
            accessories: AtomicUsize::new(0),
        }
    }

    fn mark_closed(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        self.link.send_replace(Link::Closed(reason.to_string()));
    }
}

/// Opens [`SocketIoChannel`]s against one Homebridge instance.
pub struct SocketIoConnector {
    base_url: String,
    username: String,
    connect_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(base_url: &str, username: &str, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl ChannelConnector for SocketIoConnector {
    async fn connect(&self, token: &str) -> Result<Arc<dyn EventChannel>, TransportError> {
        let channel =
            SocketIoChannel::connect(&self.base_url, token, &self.username, self.connect_timeout)
                .await?;
        Ok(Arc::new(channel))
    }
}

/// One authenticated Socket.IO connection to the `/accessories` namespace.
pub struct SocketIoChannel {
    out_tx: mpsc::Sender<String>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    username: String,
}

impl SocketIoChannel {
    /// Connect and wait (bounded by `connect_timeout`) until the namespace
    /// connect is acknowledged.
    pub async fn connect(
        base_url: &str,
        token: &str,
        username: &str,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let url = build_socket_url(base_url, token)?;
        let timeout_ms = u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX);
        let deadline = tokio::time::Instant::now() + connect_timeout;

        let (ws_stream, _response) =
            tokio::time::timeout_at(deadline, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| TransportError::ConnectTimeout(timeout_ms))?
                .map_err(|e| TransportError::Connect(e.to_string()))?;

        let shared = Arc::new(Shared::new());
        let cancel = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);

        tokio::spawn(io_loop(
            ws_stream,
            out_rx,
            Arc::clone(&shared),
            cancel.clone(),
        ));

        let channel = Self {
            out_tx,
            shared,
            cancel,
            username: username.to_string(),
        };

        let mut link = channel.shared.link.subscribe();
        let settled = tokio::time::timeout_at(deadline, link.wait_for(|l| *l != Link::Connecting))
            .await
            .map(|r| r.map(|state| state.clone()));
        let state = match settled {
            Ok(Ok(state)) => state,
            Ok(Err(_)) => Link::Closed("I/O loop ended".into()),
            Err(_) => {
                channel.cancel.cancel();
                return Err(TransportError::ConnectTimeout(timeout_ms));
            }
        };

        match state {
            Link::Connected => Ok(channel),
            Link::Closed(reason) => Err(TransportError::Connect(reason)),
            Link::Connecting => Err(TransportError::NotConnected),
        }
    }

    async fn emit(&self, name: &str, args: Vec<Value>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = frame::encode(&frame::event(ACCESSORIES_NAMESPACE, name, args));
        self.out_tx
            .send(text)
            .await
            .map_err(|_| TransportError::Send("event stream writer closed".into()))
    }
}

impl Drop for SocketIoChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl EventChannel for SocketIoChannel {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.is_connected() && self.shared.ready.load(Ordering::SeqCst)
    }

    fn accessory_count(&self) -> usize {
        self.shared.accessories.load(Ordering::Relaxed)
    }

    async fn warm(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut epochs = self.shared.ready_epoch.subscribe();
        let seen = *epochs.borrow_and_update();

        self.emit("get-layout", vec![json!({ "user": self.username })])
            .await?;
        self.emit("get-accessories", Vec::new()).await?;

        let fresh = tokio::time::timeout(timeout, epochs.wait_for(|e| *e > seen))
            .await
            .map(|r| r.map(|_| ()));
        match fresh {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::ReadyTimeout(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    async fn set_characteristic(
        &self,
        unique_id: &str,
        characteristic: &str,
        value: Value,
    ) -> Result<(), TransportError> {
        self.emit(
            "accessory-control",
            vec![json!({
                "set": {
                    "uniqueId": unique_id,
                    "characteristicType": characteristic,
                    "value": value,
                }
            })],
        )
        .await
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.shared.mark_closed("closed by session manager");
    }
}

/// Build the Socket.IO WebSocket URL from the HTTP base URL.
fn build_socket_url(base_url: &str, token: &str) -> Result<Url, TransportError> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if base.starts_with("https://") {
        base.replacen("https://", "wss://", 1)
    } else if base.starts_with("http://") {
        base.replacen("http://", "ws://", 1)
    } else {
        return Err(TransportError::Connect(format!("Invalid URL scheme: {base}")));
    };
    let mut url = Url::parse(&format!("{ws_base}/socket.io/"))
        .map_err(|e| TransportError::Connect(format!("Invalid URL {ws_base}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("token", token)
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    Ok(url)
}

/// Main I/O loop: joins the namespace, answers pings, tracks readiness and
/// forwards outgoing events. Ends on close, error or cancellation; the
/// channel is never reconnected from here.
async fn io_loop(
    ws_stream: WsStream,
    mut out_rx: mpsc::Receiver<String>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let (mut ws_sink, mut ws_reader) = ws_stream.split();

    let join = frame::encode(&frame::connect(ACCESSORIES_NAMESPACE));
    if let Err(e) = ws_sink.send(Message::Text(join.into())).await {
        shared.mark_closed(&format!("namespace join failed: {e}"));
        return;
    }

    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = ws_sink.send(Message::Close(None)).await;
                break "cancelled".to_string();
            }
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match frame::decode(text.as_str()) {
                            Ok(Frame::Ping(payload)) => {
                                let pong = frame::encode(&Frame::Pong(payload));
                                if ws_sink.send(Message::Text(pong.into())).await.is_err() {
                                    break "pong send failed".to_string();
                                }
                            }
                            Ok(Frame::Message(packet)) => {
                                if let Some(reason) = handle_packet(&shared, packet) {
                                    break reason;
                                }
                            }
                            Ok(Frame::Close) => break "engine.io close".to_string(),
                            Ok(_) => {}
                            Err(e) => debug!("event stream: undecodable frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "connection closed".to_string(),
                    Some(Err(e)) => break format!("websocket error: {e}"),
                    _ => {} // binary, ping, pong
                }
            }
            out = out_rx.recv() => {
                let Some(text) = out else {
                    break "handle dropped".to_string();
                };
                if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                    break format!("send failed: {e}");
                }
            }
        }
    };

    debug!("event stream: I/O loop ended: {reason}");
    shared.mark_closed(&reason);
}

/// Apply one Socket.IO packet to the shared state. Returns `Some(reason)`
/// when the connection should end.
fn handle_packet(shared: &Shared, packet: Packet) -> Option<String> {
    if packet.namespace() != ACCESSORIES_NAMESPACE {
        return None;
    }
    match packet {
        Packet::Connect { .. } => {
            info!("event stream: joined {ACCESSORIES_NAMESPACE}");
            shared.connected.store(true, Ordering::SeqCst);
            shared.link.send_replace(Link::Connected);
            None
        }
        Packet::ConnectError { data, .. } => {
            let message = data
                .as_ref()
                .and_then(|d| d["message"].as_str())
                .unwrap_or("connect refused")
                .to_string();
            warn!("event stream: namespace connect rejected: {message}");
            Some(message)
        }
        Packet::Disconnect { .. } => Some("server disconnected namespace".to_string()),
        Packet::Event { name, args, .. } => {
            match name.as_str() {
                "accessories-ready-for-control" => {
                    shared.ready.store(true, Ordering::SeqCst);
                    shared.ready_epoch.send_modify(|e| *e += 1);
                    debug!("event stream: accessories ready for control");
                }
                "accessories-data" => {
                    let count = args.first().and_then(Value::as_array).map_or(0, Vec::len);
                    shared.accessories.store(count, Ordering::Relaxed);
                    debug!(count, "event stream: accessories data");
                }
                "accessory-control-failure" => {
                    warn!(detail = ?args.first(), "event stream: accessory control failure");
                }
                other => debug!("event stream: ignoring event {other}"),
            }
            None
        }
        Packet::Ack { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_from_http_base() {
        let url = build_socket_url("http://hb.local:8581/", "tok en").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://hb.local:8581/socket.io/?token=tok+en&EIO=4&transport=websocket"
        );
    }

    #[test]
    fn socket_url_from_https_base() {
        let url = build_socket_url("https://hb.example", "t").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/socket.io/");
    }

    #[test]
    fn socket_url_rejects_other_schemes() {
        assert!(matches!(
            build_socket_url("ftp://hb", "t"),
            Err(TransportError::Connect(_))
        ));
    }

    fn event(name: &str, args: Vec<Value>) -> Packet {
        Packet::Event {
            namespace: ACCESSORIES_NAMESPACE.into(),
            id: None,
            name: name.into(),
            args,
        }
    }

    #[test]
    fn namespace_connect_marks_connected() {
        let shared = Shared::new();
        let packet = Packet::Connect {
            namespace: ACCESSORIES_NAMESPACE.into(),
            data: None,
        };
        assert!(handle_packet(&shared, packet).is_none());
        assert!(shared.connected.load(Ordering::SeqCst));
        assert_eq!(*shared.link.borrow(), Link::Connected);
    }

    #[test]
    fn ready_event_bumps_epoch() {
        let shared = Shared::new();
        let rx = shared.ready_epoch.subscribe();
        handle_packet(&shared, event("accessories-ready-for-control", vec![]));
        handle_packet(&shared, event("accessories-ready-for-control", vec![]));
        assert!(shared.ready.load(Ordering::SeqCst));
        assert_eq!(*rx.borrow(), 2);
    }

    #[test]
    fn accessories_data_records_count() {
        let shared = Shared::new();
        handle_packet(
            &shared,
            event("accessories-data", vec![json!([{"uniqueId": "a"}, {"uniqueId": "b"}])]),
        );
        assert_eq!(shared.accessories.load(Ordering::Relaxed), 2);
    }

    /// A connected channel with no I/O loop; frames land in the returned receiver.
    fn detached_channel() -> (SocketIoChannel, mpsc::Receiver<String>) {
        let shared = Arc::new(Shared::new());
        shared.connected.store(true, Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let channel = SocketIoChannel {
            out_tx,
            shared,
            cancel: CancellationToken::new(),
            username: "admin".into(),
        };
        (channel, out_rx)
    }

    #[tokio::test]
    async fn warm_resolves_on_next_ready_signal() {
        let (channel, mut out_rx) = detached_channel();
        handle_packet(&channel.shared, event("accessories-ready-for-control", vec![]));
        handle_packet(
            &channel.shared,
            event("accessories-data", vec![json!([{"uniqueId": "a"}])]),
        );

        let shared = Arc::clone(&channel.shared);
        let upstream = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(text) = out_rx.recv().await {
                let listing = text.contains("get-accessories");
                frames.push(text);
                if listing {
                    handle_packet(&shared, event("accessories-ready-for-control", vec![]));
                    break;
                }
            }
            frames
        });

        channel.warm(Duration::from_secs(3)).await.unwrap();
        let frames = upstream.await.unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("get-layout"));
        assert!(frames[1].contains("get-accessories"));
        assert!(channel.is_ready());
        assert_eq!(channel.accessory_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn warm_times_out_without_ready_signal() {
        let (channel, _out_rx) = detached_channel();
        handle_packet(&channel.shared, event("accessories-ready-for-control", vec![]));

        let result = channel.warm(Duration::from_millis(3000)).await;
        assert!(matches!(result, Err(TransportError::ReadyTimeout(3000))));
    }

    #[tokio::test]
    async fn warm_on_closed_channel_fails_fast() {
        let (channel, _out_rx) = detached_channel();
        channel.shared.mark_closed("gone");
        assert!(matches!(
            channel.warm(Duration::from_secs(3)).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn connect_error_ends_the_link() {
        let shared = Shared::new();
        let reason = handle_packet(
            &shared,
            Packet::ConnectError {
                namespace: ACCESSORIES_NAMESPACE.into(),
                data: Some(json!({"message": "Unauthorized"})),
            },
        );
        assert_eq!(reason.as_deref(), Some("Unauthorized"));
    }

    #[test]
    fn other_namespaces_are_ignored() {
        let shared = Shared::new();
        let packet = Packet::Connect {
            namespace: "/status".into(),
            data: None,
        };
        assert!(handle_packet(&shared, packet).is_none());
        assert!(!shared.connected.load(Ordering::SeqCst));
    }

    #[test]
    fn mark_closed_clears_readiness() {
        let shared = Shared::new();
        shared.connected.store(true, Ordering::SeqCst);
        shared.ready.store(true, Ordering::SeqCst);
        shared.mark_closed("bye");
        assert!(!shared.connected.load(Ordering::SeqCst));
        assert!(!shared.ready.load(Ordering::SeqCst));
        assert_eq!(*shared.link.borrow(), Link::Closed("bye".into()));
    }
}
