// Backend JSON shapes and their conversion into domain models
// The backend is not consistent about field names, so decoding is tolerant:
// ids come as `_id` or `id`, users as a bare id or an object, bodies as
// `content` or `message`, timestamps as RFC 3339 strings or unix millis.

use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::models::{
    ConversationSummary, DeliveryStatus, LastMessage, Message, MessageId, PresenceEntry, PresenceStatus,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireUser {
    Id(String),
    Object(WireUserObject),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUserObject {
    #[serde(rename = "_id")]
    pub mongo_id: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub avatar: Option<String>,
}

impl WireUser {
    pub fn id(&self) -> Option<&str> {
        match self {
            WireUser::Id(id) => Some(id),
            WireUser::Object(obj) => obj.mongo_id.as_deref().or(obj.id.as_deref()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            WireUser::Id(_) => None,
            WireUser::Object(obj) => obj.name.as_deref().or(obj.username.as_deref()),
        }
    }

    pub fn avatar(&self) -> Option<&str> {
        match self {
            WireUser::Id(_) => None,
            WireUser::Object(obj) => obj.avatar.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "_id")]
    pub mongo_id: Option<String>,
    pub id: Option<String>,
    pub sender: Option<WireUser>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub receiver: Option<WireUser>,
    pub receiver_id: Option<String>,
    pub content: Option<String>,
    /// Some endpoints carry the body here instead of `content`.
    pub message: Option<Value>,
    pub created_at: Option<Value>,
    pub timestamp: Option<Value>,
}

impl WireMessage {
    pub fn from_value(value: &Value) -> SyncResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Body text, preferring `content` over `message`.
    pub fn body(&self) -> Option<&str> {
        self.content
            .as_deref()
            .or_else(|| self.message.as_ref().and_then(Value::as_str))
    }

    pub fn into_message(self) -> SyncResult<Message> {
        let id = self
            .mongo_id
            .clone()
            .or_else(|| self.id.clone())
            .ok_or_else(|| SyncError::Malformed("message without id".into()))?;
        let sender_id = self
            .sender_id
            .clone()
            .or_else(|| self.sender.as_ref().and_then(|u| u.id().map(str::to_string)))
            .ok_or_else(|| SyncError::Malformed(format!("message {} without sender", id)))?;
        let receiver_id = self
            .receiver_id
            .clone()
            .or_else(|| self.receiver.as_ref().and_then(|u| u.id().map(str::to_string)))
            .ok_or_else(|| SyncError::Malformed(format!("message {} without receiver", id)))?;
        let content = self
            .body()
            .ok_or_else(|| SyncError::Malformed(format!("message {} without body", id)))?
            .to_string();
        let sender_name = self
            .sender_name
            .clone()
            .or_else(|| self.sender.as_ref().and_then(|u| u.name().map(str::to_string)))
            .unwrap_or_else(|| sender_id.clone());
        let created_at = self
            .created_at
            .as_ref()
            .or(self.timestamp.as_ref())
            .and_then(parse_timestamp)
            .unwrap_or_else(|| {
                warn!("Message {} has no usable timestamp, using local time", id);
                Utc::now()
            });

        Ok(Message {
            id: MessageId::Server(id),
            sender_id,
            sender_name,
            receiver_id,
            content,
            created_at,
            delivery_status: DeliveryStatus::Delivered,
            optimistic: false,
        })
    }
}

/// Decode a single message object.
pub fn message_from_value(value: &Value) -> SyncResult<Message> {
    WireMessage::from_value(value)?.into_message()
}

/// Accepts an RFC 3339 string or a number of unix milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Pull the array out of a list response, which is either a bare array or
/// an object wrapping one under a well-known key.
pub fn list_items<'a>(value: &'a Value, keys: &[&str]) -> SyncResult<&'a Vec<Value>> {
    if let Some(items) = value.as_array() {
        return Ok(items);
    }
    keys.iter()
        .chain(["data"].iter())
        .find_map(|key| value.get(*key).and_then(Value::as_array))
        .ok_or_else(|| SyncError::Malformed("expected a list response".into()))
}

/// Decode every message of a list response, dropping the ones that do not parse.
pub fn messages_from_list(value: &Value) -> SyncResult<Vec<Message>> {
    let items = list_items(value, &["messages"])?;
    Ok(items
        .iter()
        .filter_map(|item| match message_from_value(item) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Dropping malformed message in list response: {}", e);
                None
            }
        })
        .collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConversation {
    #[serde(rename = "_id")]
    mongo_id: Option<Value>,
    user: Option<WireUser>,
    partner: Option<WireUser>,
    last_message: Option<Value>,
    last_message_at: Option<Value>,
    unread_count: Option<u32>,
}

pub fn conversation_from_value(value: &Value) -> SyncResult<ConversationSummary> {
    let wire: WireConversation = serde_json::from_value(value.clone())?;
    let peer = wire.partner.as_ref().or(wire.user.as_ref());
    let peer_id = peer
        .and_then(|u| u.id().map(str::to_string))
        .or_else(|| wire.mongo_id.as_ref().and_then(Value::as_str).map(str::to_string))
        .ok_or_else(|| SyncError::Malformed("conversation without partner id".into()))?;

    let last_message = match &wire.last_message {
        Some(Value::String(text)) => wire
            .last_message_at
            .as_ref()
            .and_then(parse_timestamp)
            .map(|created_at| LastMessage {
                content: text.clone(),
                created_at,
            }),
        Some(obj @ Value::Object(_)) => {
            let msg = WireMessage::from_value(obj)?;
            let created_at = msg
                .created_at
                .as_ref()
                .or(msg.timestamp.as_ref())
                .or(wire.last_message_at.as_ref())
                .and_then(parse_timestamp);
            match (msg.body(), created_at) {
                (Some(body), Some(created_at)) => Some(LastMessage {
                    content: body.to_string(),
                    created_at,
                }),
                _ => None,
            }
        }
        _ => None,
    };

    Ok(ConversationSummary {
        peer_name: peer.and_then(|u| u.name().map(str::to_string)),
        avatar_url: peer.and_then(|u| u.avatar().map(str::to_string)),
        peer_id,
        last_message,
        unread_count: wire.unread_count.unwrap_or(0),
    })
}

pub fn conversations_from_list(value: &Value) -> SyncResult<Vec<ConversationSummary>> {
    let items = list_items(value, &["conversations"])?;
    Ok(items
        .iter()
        .filter_map(|item| match conversation_from_value(item) {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Dropping malformed conversation summary: {}", e);
                None
            }
        })
        .collect())
}

/// Presence payloads: `"id"`, `{userId, status, lastSeen}` or a user object.
pub fn presence_from_value(value: &Value, default_status: PresenceStatus) -> SyncResult<PresenceEntry> {
    let user_id = match value {
        Value::String(id) => Some(id.clone()),
        Value::Object(obj) => ["userId", "_id", "id"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
    .ok_or_else(|| SyncError::Malformed("presence without user id".into()))?;

    let status = match value.get("status").and_then(Value::as_str) {
        Some(raw) => PresenceStatus::parse(raw)
            .ok_or_else(|| SyncError::Malformed(format!("unknown presence status '{}'", raw)))?,
        None => default_status,
    };
    let last_seen = value.get("lastSeen").and_then(parse_timestamp);

    Ok(PresenceEntry {
        user_id,
        status,
        last_seen,
    })
}
