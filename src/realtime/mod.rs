// Realtime chat session
// Entry point for everything that happens over the realtime connection. The
// session owns one instance of each component and routes connection events to
// them; the components themselves only talk to the injected channel and REST
// client.

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

pub mod codec;
pub mod connection;
pub mod conversations;
pub mod events;
pub mod message_sync;
pub mod presence;
pub mod typing;

pub use connection::{Ack, ConnectionHandle, ConnectionManager, RealtimeChannel, RealtimeEvent};
pub use conversations::ConversationListProjector;
pub use events::{names, InboundEvent, MarkReadAck};
pub use message_sync::{InboundOutcome, MessageList, MessageSyncEngine, SendHandle};
pub use presence::PresenceTracker;
pub use typing::TypingTracker;

use crate::config::Timeouts;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    ConversationPartner, ConversationSummary, Message, MessageId, PresenceStatus, UserRef,
};
use crate::rest::MessageApi;
use crate::wire;

/// Something the host should repaint or announce after an event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Connected,
    Disconnected { reason: String },
    ConnectError { message: String },
    ReconnectFailed { attempts: u32 },
    PresenceSnapshot { online: usize },
    PresenceChanged { user_id: String, status: PresenceStatus },
    MessageAppended(Message),
    Unread { peer_id: String, count: u32 },
    MessageFailed { id: MessageId, reason: String },
    Typing { peer_id: String, typing: bool },
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct ChatSession {
    me: UserRef,
    timeouts: Timeouts,
    channel: Arc<dyn RealtimeChannel>,
    api: Arc<dyn MessageApi>,
    presence: Arc<Mutex<PresenceTracker>>,
    typing: TypingTracker,
    messages: MessageSyncEngine,
    conversations: Arc<Mutex<ConversationListProjector>>,
    history: Arc<Mutex<Vec<Message>>>,
    summaries: Arc<Mutex<Vec<ConversationSummary>>>,
    mark_reads: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl ChatSession {
    pub fn new(
        me: UserRef,
        channel: Arc<dyn RealtimeChannel>,
        api: Arc<dyn MessageApi>,
        timeouts: Timeouts,
        page_size: u32,
    ) -> Self {
        let typing = TypingTracker::new(channel.clone(), timeouts.typing_idle(), timeouts.typing_display());
        let messages = MessageSyncEngine::new(
            me.clone(),
            channel.clone(),
            api.clone(),
            timeouts.fallback(),
            page_size,
        );
        ChatSession {
            conversations: Arc::new(Mutex::new(ConversationListProjector::new(me.id.clone()))),
            me,
            timeouts,
            channel,
            api,
            presence: Arc::new(Mutex::new(PresenceTracker::new())),
            typing,
            messages,
            history: Arc::new(Mutex::new(Vec::new())),
            summaries: Arc::new(Mutex::new(Vec::new())),
            mark_reads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn me(&self) -> &UserRef {
        &self.me
    }

    pub fn messages(&self) -> &MessageSyncEngine {
        &self.messages
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn active_peer(&self) -> Option<String> {
        self.messages.active_peer()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Dispatch one event from the connection. Malformed payloads are logged
    /// and dropped.
    pub async fn handle_event(&self, event: RealtimeEvent) -> Option<SessionUpdate> {
        match event {
            RealtimeEvent::Connected => {
                self.on_connected();
                Some(SessionUpdate::Connected)
            }
            RealtimeEvent::Disconnected { reason } => Some(SessionUpdate::Disconnected { reason }),
            RealtimeEvent::ConnectError { message } => Some(SessionUpdate::ConnectError { message }),
            RealtimeEvent::ReconnectFailed { attempts } => Some(SessionUpdate::ReconnectFailed { attempts }),
            RealtimeEvent::Event { name, payload } => match InboundEvent::decode(&name, &payload) {
                Ok(Some(inbound)) => self.apply(inbound).await,
                Ok(None) => {
                    debug!("Ignoring unhandled event {}", name);
                    None
                }
                Err(e) => {
                    warn!("Dropping malformed {} event: {}", name, e);
                    None
                }
            },
        }
    }

    async fn apply(&self, event: InboundEvent) -> Option<SessionUpdate> {
        match event {
            InboundEvent::OnlineUsers(entries) => {
                let online = entries.len();
                locked(&self.presence).apply_snapshot(entries, Utc::now());
                info!("Presence snapshot with {} online users", online);
                Some(SessionUpdate::PresenceSnapshot { online })
            }
            InboundEvent::StatusUpdate(entry) => {
                let user_id = entry.user_id.clone();
                let status = entry.status;
                locked(&self.presence).apply_delta(entry, Utc::now());
                debug!("{} is now {}", user_id, status);
                Some(SessionUpdate::PresenceChanged { user_id, status })
            }
            InboundEvent::NewMessage { message, unread_count } => self.on_new_message(message, unread_count),
            InboundEvent::MessageError { temp_id, reason } => self
                .messages
                .handle_message_error(temp_id.as_deref(), &reason)
                .map(|id| SessionUpdate::MessageFailed { id, reason }),
            InboundEvent::UserTyping { user_id, typing } => {
                self.typing.on_peer_typing(&user_id, typing);
                Some(SessionUpdate::Typing {
                    peer_id: user_id,
                    typing,
                })
            }
        }
    }

    fn on_new_message(&self, message: Message, reported_unread: Option<u32>) -> Option<SessionUpdate> {
        let from_peer = message.sender_id != self.me.id;
        if from_peer {
            // A message ends the sender's typing burst.
            self.typing.on_peer_typing(&message.sender_id, false);
        }
        locked(&self.conversations).record_live_message(&message);

        match self.messages.handle_inbound(message.clone(), reported_unread) {
            InboundOutcome::Appended => {
                if from_peer {
                    self.schedule_mark_read(&message.sender_id);
                }
                Some(SessionUpdate::MessageAppended(message))
            }
            InboundOutcome::Unread { peer_id, reported } => {
                let count = locked(&self.conversations).record_inbound(&peer_id, reported);
                debug!("{} unread from {}", count, peer_id);
                Some(SessionUpdate::Unread { peer_id, count })
            }
            InboundOutcome::Duplicate => {
                debug!("Duplicate message {} ignored", message.id);
                None
            }
            InboundOutcome::Ignored => None,
        }
    }

    fn on_connected(&self) {
        let pending = locked(&self.conversations).pending_read_peers();
        for peer in pending {
            info!("Re-sending mark-read for {} after reconnect", peer);
            self.schedule_mark_read(&peer);
        }
        if let Some(peer) = self.messages.active_peer() {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.query_status(&peer).await {
                    debug!("Status query for {} failed: {}", peer, e);
                }
            });
        }
    }

    /// Make `peer_id` the open conversation: zero its unread right away, mark
    /// it read on the server after the debounce and load its first history
    /// page. Returns the number of history messages added.
    pub async fn open_conversation(&self, peer_id: &str) -> SyncResult<usize> {
        if let Some(previous) = self.messages.active_peer() {
            if previous != peer_id {
                self.typing.stop_typing(&previous).await;
            }
        }

        {
            let mut conversations = locked(&self.conversations);
            conversations.set_active_peer(Some(peer_id));
            conversations.begin_read(peer_id);
        }
        self.messages.set_active_peer(Some(peer_id));
        info!("Opened conversation with {}", peer_id);
        self.schedule_mark_read(peer_id);

        self.messages.load_history(peer_id).await
    }

    pub async fn close_conversation(&self) {
        if let Some(previous) = self.messages.active_peer() {
            self.typing.stop_typing(&previous).await;
        }
        locked(&self.conversations).set_active_peer(None);
        self.messages.set_active_peer(None);
    }

    pub async fn load_older(&self) -> SyncResult<usize> {
        let peer = self.messages.active_peer().ok_or(SyncError::NoActiveConversation)?;
        self.messages.load_older(&peer).await
    }

    fn schedule_mark_read(&self, peer_id: &str) {
        let session = self.clone();
        let peer = peer_id.to_string();
        let delay = self.timeouts.mark_read_debounce();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            session.mark_read_now(&peer).await;
        });
        if let Some(previous) = locked(&self.mark_reads).insert(peer_id.to_string(), task) {
            previous.abort();
        }
    }

    async fn mark_read_now(&self, peer_id: &str) {
        if !self.channel.is_connected() {
            debug!("Offline, mark-read for {} waits for the next connect", peer_id);
            return;
        }
        let attempt = async {
            let ack = self
                .channel
                .emit_with_ack(names::MARK_AS_READ, json!({ "senderId": peer_id }))
                .await?;
            ack.wait().await
        };
        let value = match tokio::time::timeout(self.timeouts.fallback(), attempt).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!("Mark-read for {} got no answer: {}", peer_id, e);
                return;
            }
            Err(_) => {
                warn!("Mark-read for {} timed out", peer_id);
                return;
            }
        };

        match MarkReadAck::parse(&value) {
            MarkReadAck::Marked(count) => {
                debug!("Server marked {} messages from {} read", count, peer_id);
                locked(&self.conversations).confirm_read(peer_id);
            }
            MarkReadAck::Failed(reason) => {
                let restored = locked(&self.conversations).rollback_read(peer_id);
                warn!(
                    "Mark-read for {} failed ({}), unread restored to {:?}",
                    peer_id, reason, restored
                );
            }
        }
    }

    /// Ask the server for one user's status and record the answer.
    pub async fn query_status(&self, user_id: &str) -> SyncResult<PresenceStatus> {
        let attempt = async {
            let ack = self
                .channel
                .emit_with_ack(names::GET_USER_STATUS, json!({ "userId": user_id }))
                .await?;
            ack.wait().await
        };
        let value = tokio::time::timeout(self.timeouts.fallback(), attempt)
            .await
            .map_err(|_| SyncError::AckDropped(names::GET_USER_STATUS.to_string()))??;

        let value = match value {
            Value::String(status) => json!({ "userId": user_id, "status": status }),
            Value::Object(mut obj) => {
                obj.entry("userId").or_insert_with(|| json!(user_id));
                Value::Object(obj)
            }
            other => {
                return Err(SyncError::Malformed(format!("status answer {}", other)));
            }
        };
        let entry = wire::presence_from_value(&value, PresenceStatus::Offline)?;
        let status = entry.status;
        locked(&self.presence).apply_query_response(entry, Utc::now());
        Ok(status)
    }

    /// Send `text` to the open conversation, ending any typing signal first.
    pub async fn send(&self, text: &str) -> SyncResult<SendHandle> {
        if let Some(peer) = self.messages.active_peer() {
            self.typing.stop_typing(&peer).await;
        }
        let handle = self.messages.submit(text)?;
        if let Some(optimistic) = self.messages.find(&handle.peer_id, &handle.temp_id) {
            locked(&self.conversations).record_live_message(&optimistic);
        }
        Ok(handle)
    }

    pub fn resend(&self, temp_id: &MessageId) -> SyncResult<SendHandle> {
        self.messages.resend(temp_id)
    }

    /// Local keystroke in the open conversation.
    pub async fn start_typing(&self) {
        if let Some(peer) = self.messages.active_peer() {
            self.typing.start_typing(&peer).await;
        }
    }

    /// Refetch the flat history and conversation summaries, then project.
    pub async fn refresh_conversation_list(&self) -> SyncResult<Vec<ConversationPartner>> {
        let history = self.api.fetch_user_messages().await?;
        let summaries = self.api.fetch_conversations().await?;
        info!(
            "Conversation list refreshed: {} messages, {} summaries",
            history.len(),
            summaries.len()
        );
        locked(&self.conversations).seed_unread(&summaries);
        *locked(&self.history) = history;
        *locked(&self.summaries) = summaries;
        Ok(self.conversation_list())
    }

    pub fn conversation_list(&self) -> Vec<ConversationPartner> {
        let history = locked(&self.history).clone();
        let summaries = locked(&self.summaries).clone();
        let presence = locked(&self.presence).clone();
        locked(&self.conversations).project(&history, &summaries, &presence)
    }

    /// Unread ledger value for `peer_id`.
    pub fn unread_count(&self, peer_id: &str) -> u32 {
        locked(&self.conversations).unread_count(peer_id)
    }

    /// Badge to display for `peer_id`; always 0 for the open conversation.
    pub fn unread_badge(&self, peer_id: &str) -> u32 {
        locked(&self.conversations).badge(peer_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        locked(&self.presence).is_online(user_id)
    }

    pub fn status_of(&self, user_id: &str) -> PresenceStatus {
        locked(&self.presence).status_of(user_id)
    }

    pub fn is_typing(&self, peer_id: &str) -> bool {
        self.typing.is_typing(peer_id)
    }

    pub fn visible_messages(&self) -> Vec<Message> {
        self.messages.visible_messages()
    }
}
