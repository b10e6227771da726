//! Engine.IO v4 / Socket.IO v5 text frames.
//!
//! Only the subset spoken by the Homebridge UI accessories gateway is
//! supported: text packets, namespaces and optional ack ids. Binary
//! attachments are rejected.
//!
//! ```text
//! 2                                   engine ping
//! 40/accessories,                     namespace connect
//! 42/accessories,["get-accessories"]  event
//! ```

use serde_json::Value;
use thiserror::Error;

/// Namespace used by the Homebridge UI for accessory control.
pub const ACCESSORIES_NAMESPACE: &str = "/accessories";

/// An Engine.IO frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Handshake with `sid`, `pingInterval`, `pingTimeout`.
    Open(Value),
    Close,
    Ping(String),
    Pong(String),
    Message(Packet),
    Upgrade,
    Noop,
}

/// A Socket.IO packet carried in an Engine.IO message frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Option<Value>,
    },
}

impl Packet {
    pub fn namespace(&self) -> &str {
        match self {
            Self::Connect { namespace, .. }
            | Self::Disconnect { namespace }
            | Self::Event { namespace, .. }
            | Self::Ack { namespace, .. }
            | Self::ConnectError { namespace, .. } => namespace,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown engine.io frame type {0:?}")]
    UnknownFrameType(char),
    #[error("unknown socket.io packet type {0:?}")]
    UnknownPacketType(char),
    #[error("binary socket.io packets are not supported")]
    Binary,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("event packet without a name")]
    MissingEventName,
    #[error("ack packet without an id")]
    MissingAckId,
}

/// Build a namespace-connect frame.
pub fn connect(namespace: &str) -> Frame {
    Frame::Message(Packet::Connect {
        namespace: namespace.to_string(),
        data: None,
    })
}

/// Build an event frame without ack id.
pub fn event(namespace: &str, name: &str, args: Vec<Value>) -> Frame {
    Frame::Message(Packet::Event {
        namespace: namespace.to_string(),
        id: None,
        name: name.to_string(),
        args,
    })
}

pub fn decode(text: &str) -> Result<Frame, FrameError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(FrameError::Empty)?;
    let rest = chars.as_str();
    match kind {
        '0' => serde_json::from_str(rest)
            .map(Frame::Open)
            .map_err(|e| FrameError::InvalidPayload(e.to_string())),
        '1' => Ok(Frame::Close),
        '2' => Ok(Frame::Ping(rest.to_string())),
        '3' => Ok(Frame::Pong(rest.to_string())),
        '4' => decode_packet(rest).map(Frame::Message),
        '5' => Ok(Frame::Upgrade),
        '6' => Ok(Frame::Noop),
        other => Err(FrameError::UnknownFrameType(other)),
    }
}

fn decode_packet(text: &str) -> Result<Packet, FrameError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(FrameError::Empty)?;
    let mut rest = chars.as_str();

    if matches!(kind, '5' | '6') {
        return Err(FrameError::Binary);
    }

    let namespace = if rest.starts_with('/') {
        match rest.find(',') {
            Some(idx) => {
                let ns = &rest[..idx];
                rest = &rest[idx + 1..];
                ns.to_string()
            }
            None => {
                let ns = rest.to_string();
                rest = "";
                ns
            }
        }
    } else {
        "/".to_string()
    };

    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    let id = if digits > 0 {
        let parsed = rest[..digits]
            .parse::<u64>()
            .map_err(|e| FrameError::InvalidPayload(e.to_string()))?;
        rest = &rest[digits..];
        Some(parsed)
    } else {
        None
    };

    let payload = if rest.is_empty() {
        None
    } else {
        Some(
            serde_json::from_str::<Value>(rest)
                .map_err(|e| FrameError::InvalidPayload(e.to_string()))?,
        )
    };

    match kind {
        '0' => Ok(Packet::Connect {
            namespace,
            data: payload,
        }),
        '1' => Ok(Packet::Disconnect { namespace }),
        '2' => {
            let Some(Value::Array(mut items)) = payload else {
                return Err(FrameError::MissingEventName);
            };
            if items.is_empty() {
                return Err(FrameError::MissingEventName);
            }
            let Value::String(name) = items.remove(0) else {
                return Err(FrameError::MissingEventName);
            };
            Ok(Packet::Event {
                namespace,
                id,
                name,
                args: items,
            })
        }
        '3' => {
            let id = id.ok_or(FrameError::MissingAckId)?;
            let args = match payload {
                Some(Value::Array(items)) => items,
                Some(other) => vec![other],
                None => Vec::new(),
            };
            Ok(Packet::Ack {
                namespace,
                id,
                args,
            })
        }
        '4' => Ok(Packet::ConnectError {
            namespace,
            data: payload,
        }),
        other => Err(FrameError::UnknownPacketType(other)),
    }
}

pub fn encode(frame: &Frame) -> String {
    match frame {
        Frame::Open(v) => format!("0{v}"),
        Frame::Close => "1".to_string(),
        Frame::Ping(p) => format!("2{p}"),
        Frame::Pong(p) => format!("3{p}"),
        Frame::Message(packet) => format!("4{}", encode_packet(packet)),
        Frame::Upgrade => "5".to_string(),
        Frame::Noop => "6".to_string(),
    }
}

fn encode_packet(packet: &Packet) -> String {
    let mut out = String::new();
    let (kind, id, payload) = match packet {
        Packet::Connect { data, .. } => ('0', None, data.clone()),
        Packet::Disconnect { .. } => ('1', None, None),
        Packet::Event { id, name, args, .. } => {
            let mut items = Vec::with_capacity(args.len() + 1);
            items.push(Value::String(name.clone()));
            items.extend(args.iter().cloned());
            ('2', *id, Some(Value::Array(items)))
        }
        Packet::Ack { id, args, .. } => ('3', Some(*id), Some(Value::Array(args.clone()))),
        Packet::ConnectError { data, .. } => ('4', None, data.clone()),
    };
    out.push(kind);

    let namespace = packet.namespace();
    if namespace != "/" {
        out.push_str(namespace);
        out.push(',');
    }
    if let Some(id) = id {
        out.push_str(&id.to_string());
    }
    if let Some(payload) = payload {
        out.push_str(&payload.to_string());
    }
    out
}
