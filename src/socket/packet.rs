//! Engine.IO v4 / Socket.IO v5 text framing.
//!
//! Each WebSocket text frame carries one Engine.IO packet. Engine.IO
//! `message` packets carry one Socket.IO packet:
//! `<type>[<namespace>,][<ack id>][<json>]`.

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{ ClientError, Result };

/// Payload of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(OpenInfo),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or_else(|| ClientError::Protocol("empty frame".into()))?;
        let body = chars.as_str();
        let packet = match kind {
            '0' => EnginePacket::Open(serde_json::from_str(body)?),
            '1' => EnginePacket::Close,
            '2' => EnginePacket::Ping(body.to_string()),
            '3' => EnginePacket::Pong(body.to_string()),
            '4' => EnginePacket::Message(body.to_string()),
            '5' => EnginePacket::Upgrade,
            '6' => EnginePacket::Noop,
            other => {
                return Err(ClientError::Protocol(format!("unknown engine packet type '{}'", other)));
            }
        };
        Ok(packet)
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(_) => "0".to_string(),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(payload) => format!("2{}", payload),
            EnginePacket::Pong(payload) => format!("3{}", payload),
            EnginePacket::Message(body) => format!("4{}", body),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

impl PacketKind {
    fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(PacketKind::Connect),
            '1' => Some(PacketKind::Disconnect),
            '2' => Some(PacketKind::Event),
            '3' => Some(PacketKind::Ack),
            '4' => Some(PacketKind::ConnectError),
            '5' => Some(PacketKind::BinaryEvent),
            '6' => Some(PacketKind::BinaryAck),
            _ => None,
        }
    }

    fn digit(&self) -> char {
        match self {
            PacketKind::Connect => '0',
            PacketKind::Disconnect => '1',
            PacketKind::Event => '2',
            PacketKind::Ack => '3',
            PacketKind::ConnectError => '4',
            PacketKind::BinaryEvent => '5',
            PacketKind::BinaryAck => '6',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub kind: PacketKind,
    pub namespace: String,
    pub ack_id: Option<u64>,
    pub data: Option<JsonValue>,
}

impl SocketPacket {
    pub fn connect(namespace: &str) -> Self {
        Self { kind: PacketKind::Connect, namespace: namespace.to_string(), ack_id: None, data: None }
    }

    pub fn disconnect(namespace: &str) -> Self {
        Self {
            kind: PacketKind::Disconnect,
            namespace: namespace.to_string(),
            ack_id: None,
            data: None,
        }
    }

    pub fn event(namespace: &str, name: &str, payload: JsonValue) -> Self {
        Self {
            kind: PacketKind::Event,
            namespace: namespace.to_string(),
            ack_id: None,
            data: Some(JsonValue::Array(vec![JsonValue::String(name.to_string()), payload])),
        }
    }

    pub fn decode(body: &str) -> Result<Self> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .and_then(PacketKind::from_digit)
            .ok_or_else(|| ClientError::Protocol(format!("bad socket packet '{}'", body)))?;

        if matches!(kind, PacketKind::BinaryEvent | PacketKind::BinaryAck) {
            return Err(ClientError::Protocol("binary packets are not supported".into()));
        }

        let mut rest = chars.as_str();
        let namespace = if rest.starts_with('/') {
            match rest.split_once(',') {
                Some((ns, tail)) => {
                    rest = tail;
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

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|e| ClientError::Protocol(format!("bad ack id: {}", e)))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.is_empty() { None } else { Some(serde_json::from_str(rest)?) };

        Ok(Self { kind, namespace, ack_id, data })
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.kind.digit());
        if self.namespace != "/" {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    /// Event name and first argument of an `Event` packet.
    pub fn event_parts(&self) -> Option<(&str, JsonValue)> {
        if self.kind != PacketKind::Event {
            return None;
        }
        let args = self.data.as_ref()?.as_array()?;
        let name = args.first()?.as_str()?;
        Some((name, args.get(1).cloned().unwrap_or(JsonValue::Null)))
    }

    /// `message` field of a `ConnectError` payload, if present.
    pub fn error_message(&self) -> String {
        self.data
            .as_ref()
            .and_then(|d| d.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .or_else(|| self.data.as_ref().map(|d| d.to_string()))
            .unwrap_or_else(|| "connection refused".to_string())
    }
}
