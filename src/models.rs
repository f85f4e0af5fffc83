use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a message: client-generated until the server confirms it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Temp(String),
    Server(String),
}

impl MessageId {
    /// Temporary id in the `temp-<unix millis>` form used for optimistic entries.
    pub fn temp(at: DateTime<Utc>) -> Self {
        MessageId::Temp(format!("temp-{}", at.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Temp(id) | MessageId::Server(id) => id,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, MessageId::Temp(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,      // Optimistic, waiting for the server
    Delivered, // Confirmed by socket ack or REST response
    Error,     // Both delivery paths failed
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub sender_name: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub optimistic: bool,
}

impl Message {
    /// Build the optimistic entry shown the moment the user hits send.
    pub fn optimistic(
        id: MessageId,
        sender: &UserRef,
        receiver_id: &str,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Message {
            id,
            sender_id: sender.id.clone(),
            sender_name: sender.name.clone(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            created_at,
            delivery_status: DeliveryStatus::Sent,
            optimistic: true,
        }
    }

    /// The other participant, seen from `me`.
    pub fn peer_of(&self, me: &str) -> &str {
        if self.sender_id == me {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    /// True when the message was exchanged between `a` and `b`, in either direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b) || (self.sender_id == b && self.receiver_id == a)
    }
}

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub name: String,
}

impl UserRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        UserRef {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
    Busy,
}

impl PresenceStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" => Some(PresenceStatus::Online),
            "offline" => Some(PresenceStatus::Offline),
            "away" | "idle" => Some(PresenceStatus::Away),
            "busy" | "dnd" => Some(PresenceStatus::Busy),
            _ => None,
        }
    }

    /// Anything but offline counts as reachable.
    pub fn is_online(self) -> bool {
        self != PresenceStatus::Offline
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceStatus::Online => write!(f, "online"),
            PresenceStatus::Offline => write!(f, "offline"),
            PresenceStatus::Away => write!(f, "away"),
            PresenceStatus::Busy => write!(f, "busy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub user_id: String,
    pub status: PresenceStatus,
    /// Only meaningful while offline.
    pub last_seen: Option<DateTime<Utc>>,
}

impl PresenceEntry {
    pub fn new(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        PresenceEntry {
            user_id: user_id.into(),
            status,
            last_seen: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastMessage {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the backend's conversation list.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub peer_id: String,
    pub peer_name: Option<String>,
    pub avatar_url: Option<String>,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
}

/// Sidebar row, derived on demand and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationPartner {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Body of a create-message request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub receiver_id: String,
    pub content: String,
}

/// Paging for conversation history, 1-based like the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        PageRequest { page: 1, limit }
    }

    pub fn next(self) -> Self {
        PageRequest {
            page: self.page + 1,
            limit: self.limit,
        }
    }
}
