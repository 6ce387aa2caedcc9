use chrono::{ DateTime, Utc };
use log::debug;
use serde::{ Deserialize, Serialize };
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

use super::voucher::Voucher;

/// Author of a chat message. Roles the client does not know are carried
/// through verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::Other(raw) => raw,
        }
    }
}

impl From<String> for Role {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "USER" => Role::User,
            "ASSISTANT" => Role::Assistant,
            _ => Role::Other(raw),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_loading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voucher_analyzed: Option<Voucher>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            is_loading: false,
            voucher_analyzed: None,
        }
    }

    /// Empty assistant message that will receive the streamed reply.
    pub fn placeholder() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            is_loading: true,
            voucher_analyzed: None,
        }
    }
}

impl From<ConversationMessageRaw> for ChatMessage {
    fn from(raw: ConversationMessageRaw) -> Self {
        let timestamp = raw.created_at
            .as_deref()
            .or(raw.timestamp.as_deref())
            .map(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let voucher_analyzed = raw.voucher_analyzed
            .filter(|v| !v.is_null())
            .and_then(|v| {
                serde_json
                    ::from_value::<Voucher>(v)
                    .map_err(|e| debug!("Ignoring malformed voucher on message {}: {}", raw.id, e))
                    .ok()
            });

        Self {
            id: raw.id,
            role: Role::from(raw.role),
            content: raw.content,
            timestamp,
            is_loading: false,
            voucher_analyzed,
        }
    }
}

/// Message as stored server-side, returned by `GET /chat/{id}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessageRaw {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub voucher_analyzed: Option<JsonValue>,
}

/// `data` of the conversation envelope: either wrapped or a bare list.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ConversationData {
    Wrapped {
        #[serde(default)]
        messages: Option<Vec<ConversationMessageRaw>>,
    },
    Bare(Vec<ConversationMessageRaw>),
}

impl ConversationData {
    pub fn into_messages(self) -> Vec<ConversationMessageRaw> {
        match self {
            ConversationData::Wrapped { messages } => messages.unwrap_or_default(),
            ConversationData::Bare(messages) => messages,
        }
    }
}

/// Final reply of the HTTP confirm flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub role: Role,
    pub reply: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voucher_analyzed: Option<Voucher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<JsonValue>,
}

/// Server timestamps are RFC 3339; anything unparsable falls back to now.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            debug!("Unparsable timestamp '{}': {}", raw, e);
            Utc::now()
        })
}
