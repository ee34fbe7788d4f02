//! Engine.IO v4 / Socket.IO v5 text packets carried over a WebSocket.
//!
//! Every WebSocket text frame is one Engine.IO packet:
//! ```text
//! 0{"sid":..,"pingInterval":..}   open (server -> client)
//! 1                               close
//! 2 / 3                           ping / pong (server pings, client pongs)
//! 4<socket.io packet>             message
//! ```
//! A Socket.IO packet inside a message starts with its type digit, then an
//! optional `/namespace,` prefix, an optional ack id, and a JSON body:
//! ```text
//! 0{...}              CONNECT (client sends `40`, server acks `40{"sid":..}`)
//! 1                   DISCONNECT
//! 2["event",{...}]    EVENT
//! 3<id>[...]          ACK
//! 4{"message":..}     CONNECT_ERROR
//! ```
//! Binary attachments (types 5 and 6) are not used by the signaling protocol.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Socket.IO handshake query for a WebSocket-only Engine.IO v4 connection.
pub const ENGINE_IO_QUERY: &str = "EIO=4&transport=websocket";

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown Engine.IO packet type '{0}'")]
    UnknownEngineType(char),
    #[error("unknown Socket.IO packet type '{0}'")]
    UnknownSocketType(char),
    #[error("binary Socket.IO packets are not supported")]
    Binary,
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parameters announced by the server in the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

fn default_ping_interval() -> u64 {
    25_000
}
fn default_ping_timeout() -> u64 {
    20_000
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        name: String,
        payload: Value,
        ack_id: Option<u64>,
    },
    Ack {
        ack_id: u64,
        args: Value,
    },
    ConnectError(Value),
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let body = chars.as_str();
        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(body)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(body.to_string())),
            '3' => Ok(EnginePacket::Pong(body.to_string())),
            '4' => Ok(EnginePacket::Message(SocketPacket::decode(body)?)),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(PacketError::UnknownEngineType(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            // Only servers send `open`; encoding it is only useful for tests.
            EnginePacket::Open(open) => format!(
                "0{{\"sid\":{},\"upgrades\":[],\"pingInterval\":{},\"pingTimeout\":{}}}",
                Value::String(open.sid.clone()),
                open.ping_interval,
                open.ping_timeout
            ),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{data}"),
            EnginePacket::Pong(data) => format!("3{data}"),
            EnginePacket::Message(packet) => format!("4{}", packet.encode()),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

impl SocketPacket {
    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = strip_namespace(chars.as_str());
        match kind {
            '0' => {
                if rest.is_empty() {
                    Ok(SocketPacket::Connect(None))
                } else {
                    Ok(SocketPacket::Connect(Some(serde_json::from_str(rest)?)))
                }
            }
            '1' => Ok(SocketPacket::Disconnect),
            '2' => {
                let (ack_id, body) = split_ack_id(rest);
                let (name, payload) = decode_event_array(body)?;
                Ok(SocketPacket::Event {
                    name,
                    payload,
                    ack_id,
                })
            }
            '3' => {
                let (ack_id, body) = split_ack_id(rest);
                let ack_id = ack_id
                    .ok_or_else(|| PacketError::MalformedEvent("ack without id".to_string()))?;
                Ok(SocketPacket::Ack {
                    ack_id,
                    args: serde_json::from_str(body)?,
                })
            }
            '4' => Ok(SocketPacket::ConnectError(serde_json::from_str(rest)?)),
            '5' | '6' => Err(PacketError::Binary),
            other => Err(PacketError::UnknownSocketType(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            SocketPacket::Connect(None) => "0".to_string(),
            SocketPacket::Connect(Some(auth)) => format!("0{auth}"),
            SocketPacket::Disconnect => "1".to_string(),
            SocketPacket::Event {
                name,
                payload,
                ack_id,
            } => {
                let array = Value::Array(vec![Value::String(name.clone()), payload.clone()]);
                match ack_id {
                    Some(id) => format!("2{id}{array}"),
                    None => format!("2{array}"),
                }
            }
            SocketPacket::Ack { ack_id, args } => format!("3{ack_id}{args}"),
            SocketPacket::ConnectError(body) => format!("4{body}"),
        }
    }
}

/// Encode an adjacently tagged (`{"event", "data"}`) message as a complete
/// Engine.IO frame, ready for a WebSocket text message.
pub fn encode_event<T: Serialize>(message: &T) -> Result<String, PacketError> {
    let value = serde_json::to_value(message)?;
    let Value::Object(mut map) = value else {
        return Err(PacketError::MalformedEvent(
            "message did not serialize to an object".to_string(),
        ));
    };
    let name = match map.remove("event") {
        Some(Value::String(name)) => name,
        _ => return Err(PacketError::MalformedEvent("missing event tag".to_string())),
    };
    let payload = map.remove("data").unwrap_or(Value::Null);
    Ok(EnginePacket::Message(SocketPacket::Event {
        name,
        payload,
        ack_id: None,
    })
    .encode())
}

/// Decode a Socket.IO event into an adjacently tagged message type.
/// A missing or null payload decodes as an empty object so that variants
/// whose fields all have defaults still match.
pub fn decode_event<T: DeserializeOwned>(name: &str, payload: Value) -> Result<T, PacketError> {
    let data = match payload {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let mut map = serde_json::Map::new();
    map.insert("event".to_string(), Value::String(name.to_string()));
    map.insert("data".to_string(), data);
    Ok(serde_json::from_value(Value::Object(map))?)
}

fn strip_namespace(text: &str) -> &str {
    if text.starts_with('/') {
        match text.find(',') {
            Some(idx) => &text[idx + 1..],
            None => "",
        }
    } else {
        text
    }
}

fn split_ack_id(text: &str) -> (Option<u64>, &str) {
    let digits = text.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return (None, text);
    }
    (text[..digits].parse().ok(), &text[digits..])
}

fn decode_event_array(body: &str) -> Result<(String, Value), PacketError> {
    let value: Value = serde_json::from_str(body)?;
    let Value::Array(mut items) = value else {
        return Err(PacketError::MalformedEvent(
            "event body is not an array".to_string(),
        ));
    };
    if items.is_empty() {
        return Err(PacketError::MalformedEvent("event array is empty".to_string()));
    }
    let name = match items.remove(0) {
        Value::String(name) => name,
        other => {
            return Err(PacketError::MalformedEvent(format!(
                "event name is not a string: {other}"
            )));
        }
    };
    let payload = if items.is_empty() {
        Value::Null
    } else {
        items.remove(0)
    };
    Ok((name, payload))
}
