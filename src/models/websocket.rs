use serde::{ Serialize, Deserialize };
use serde_json::Value as JsonValue;

use super::chat::Role;
use super::voucher::Voucher;

pub const EVENT_MESSAGE: &str = "chat.message";
pub const EVENT_CHUNK: &str = "chat.chunk";
pub const EVENT_DONE: &str = "chat.done";
pub const EVENT_ERROR: &str = "chat.error";

/// Outbound `chat.message` payload.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatChunkEvent {
    pub chunk: String,
    #[serde(default)]
    pub conversation_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatDoneEvent {
    pub conversation_id: String,
    pub role: Role,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voucher_analyzed: Option<Voucher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<JsonValue>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatErrorEvent {
    pub message: String,
}

/// Inbound event from the chat namespace, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Chunk(ChatChunkEvent),
    Done(ChatDoneEvent),
    Error(ChatErrorEvent),
}

impl SocketEvent {
    /// Maps a named Socket.IO event to a chat event. `Ok(None)` for names
    /// this client does not listen to.
    pub fn from_named(name: &str, payload: JsonValue) -> Result<Option<Self>, serde_json::Error> {
        let event = match name {
            EVENT_CHUNK => SocketEvent::Chunk(serde_json::from_value(payload)?),
            EVENT_DONE => SocketEvent::Done(serde_json::from_value(payload)?),
            EVENT_ERROR => SocketEvent::Error(serde_json::from_value(payload)?),
            _ => {
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SocketEvent::Chunk(_) => EVENT_CHUNK,
            SocketEvent::Done(_) => EVENT_DONE,
            SocketEvent::Error(_) => EVENT_ERROR,
        }
    }
}
