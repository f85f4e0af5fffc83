// Realtime event names and decoding of inbound event payloads

use log::warn;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::models::{Message, PresenceEntry, PresenceStatus};
use crate::wire;

/// Event names of the backend's realtime contract.
pub mod names {
    // Consumed
    pub const ONLINE_USERS: &str = "onlineUsers";
    pub const USER_STATUS_UPDATE: &str = "userStatusUpdate";
    pub const USER_ONLINE: &str = "userOnline";
    pub const USER_OFFLINE: &str = "userOffline";
    pub const NEW_MESSAGE: &str = "newMessage";
    pub const MESSAGE_ERROR: &str = "messageError";
    pub const USER_TYPING: &str = "userTyping";

    // Emitted
    pub const GET_USER_STATUS: &str = "getUserStatus";
    pub const MARK_AS_READ: &str = "markAsRead";
    pub const TYPING: &str = "typing";
    pub const STOP_TYPING: &str = "stopTyping";
    pub const SEND_MESSAGE: &str = "sendMessage";
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    OnlineUsers(Vec<PresenceEntry>),
    StatusUpdate(PresenceEntry),
    NewMessage {
        message: Message,
        unread_count: Option<u32>,
    },
    MessageError {
        temp_id: Option<String>,
        reason: String,
    },
    UserTyping {
        user_id: String,
        typing: bool,
    },
}

impl InboundEvent {
    /// `Ok(None)` for events this client does not consume.
    pub fn decode(name: &str, payload: &Value) -> SyncResult<Option<Self>> {
        let event = match name {
            names::ONLINE_USERS => {
                let items = wire::list_items(payload, &["users", "onlineUsers"])?;
                let entries = items
                    .iter()
                    .filter_map(|item| match wire::presence_from_value(item, PresenceStatus::Online) {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            warn!("Skipping malformed online user entry: {}", e);
                            None
                        }
                    })
                    .collect();
                InboundEvent::OnlineUsers(entries)
            }
            names::USER_STATUS_UPDATE => {
                if payload.get("status").is_none() {
                    return Err(SyncError::Malformed("status update without status".into()));
                }
                InboundEvent::StatusUpdate(wire::presence_from_value(payload, PresenceStatus::Online)?)
            }
            names::USER_ONLINE => InboundEvent::StatusUpdate(wire::presence_from_value(payload, PresenceStatus::Online)?),
            names::USER_OFFLINE => {
                let mut entry = wire::presence_from_value(payload, PresenceStatus::Offline)?;
                entry.status = PresenceStatus::Offline;
                InboundEvent::StatusUpdate(entry)
            }
            names::NEW_MESSAGE => {
                // Either `{message: {...}, unreadCount, senderId}` or the bare message.
                let (body, unread_count) = match payload.get("message") {
                    Some(inner @ Value::Object(_)) => (
                        inner,
                        payload
                            .get("unreadCount")
                            .and_then(Value::as_u64)
                            .map(|n| n.min(u32::MAX as u64) as u32),
                    ),
                    _ => (payload, None),
                };
                let mut message = wire::message_from_value(body)?;
                if let Some(sender_id) = payload.get("senderId").and_then(Value::as_str) {
                    if sender_id != message.sender_id {
                        warn!(
                            "newMessage envelope sender {} disagrees with message sender {}",
                            sender_id, message.sender_id
                        );
                        message.sender_id = sender_id.to_string();
                    }
                }
                InboundEvent::NewMessage { message, unread_count }
            }
            names::MESSAGE_ERROR => InboundEvent::MessageError {
                temp_id: ["tempId", "messageId"]
                    .iter()
                    .find_map(|key| payload.get(*key).and_then(Value::as_str))
                    .map(str::to_string),
                reason: payload
                    .get("error")
                    .or_else(|| payload.get("message"))
                    .and_then(Value::as_str)
                    .or_else(|| payload.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            },
            names::USER_TYPING => {
                let user_id = ["userId", "senderId"]
                    .iter()
                    .find_map(|key| payload.get(*key).and_then(Value::as_str))
                    .ok_or_else(|| SyncError::Malformed("typing event without user".into()))?
                    .to_string();
                let typing = payload.get("isTyping").and_then(Value::as_bool).unwrap_or(true);
                InboundEvent::UserTyping { user_id, typing }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Outcome carried by a `markAsRead` acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkReadAck {
    Marked(u64),
    Failed(String),
}

impl MarkReadAck {
    pub fn parse(value: &Value) -> Self {
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            return MarkReadAck::Failed(error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string()));
        }
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            return MarkReadAck::Failed("server reported failure".to_string());
        }
        MarkReadAck::Marked(value.get("markedCount").and_then(Value::as_u64).unwrap_or(0))
    }
}

/// Decode a `sendMessage` acknowledgment into the confirmed message.
pub fn parse_send_ack(value: &Value) -> SyncResult<Message> {
    match value.get("status").and_then(Value::as_str) {
        Some("success") => {
            let message = value
                .get("message")
                .ok_or_else(|| SyncError::Malformed("send ack without message".into()))?;
            wire::message_from_value(message)
        }
        Some(other) => Err(SyncError::Rejected(
            value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or(other)
                .to_string(),
        )),
        None => Err(SyncError::Malformed(format!("send ack without status: {}", value))),
    }
}
