// Message synchronization
// Every outgoing message goes Composing -> Optimistic(sent) -> Confirmed or
// Error. The optimistic entry is appended immediately; delivery then races the
// socket acknowledgment against a per-message fallback timer, and falls back
// to the REST create-message call when the socket is down, rejects the message
// or stays silent. Only one of the two paths ever completes a given message.

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::connection::RealtimeChannel;
use super::events::{names, parse_send_ack};
use crate::error::{SyncError, SyncResult};
use crate::models::{DeliveryStatus, Message, MessageId, NewMessage, PageRequest, UserRef};
use crate::rest::MessageApi;

/// Messages of one conversation, in insertion order. Ids are unique.
#[derive(Debug, Default, Clone)]
pub struct MessageList {
    entries: Vec<Message>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.iter().any(|m| &m.id == id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries.iter().find(|m| &m.id == id)
    }

    /// Append unless an entry with the same id exists.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.entries.push(message);
        true
    }

    /// Insert a batch (history page), returning how many were new.
    pub fn merge(&mut self, messages: Vec<Message>) -> usize {
        messages.into_iter().filter(|m| self.insert(m.clone())).count()
    }

    /// Replace the optimistic entry `temp_id` with its confirmed counterpart,
    /// keeping its slot. If the confirmed id is already present (an echo beat
    /// the ack) the optimistic entry is dropped instead.
    pub fn confirm(&mut self, temp_id: &MessageId, mut confirmed: Message) -> bool {
        confirmed.delivery_status = DeliveryStatus::Delivered;
        confirmed.optimistic = false;

        let temp_index = self.entries.iter().position(|m| &m.id == temp_id);
        let existing = self.entries.iter().position(|m| m.id == confirmed.id);
        match (temp_index, existing) {
            (Some(temp), Some(existing)) => {
                self.entries[existing].delivery_status = DeliveryStatus::Delivered;
                self.entries[existing].optimistic = false;
                self.entries.remove(temp);
                true
            }
            (Some(temp), None) => {
                self.entries[temp] = confirmed;
                true
            }
            (None, Some(_)) => false,
            (None, None) => {
                self.entries.push(confirmed);
                false
            }
        }
    }

    pub fn set_status(&mut self, id: &MessageId, status: DeliveryStatus) -> bool {
        match self.entries.iter_mut().find(|m| &m.id == id) {
            Some(entry) => {
                entry.delivery_status = status;
                true
            }
            None => false,
        }
    }

    /// Oldest optimistic entry still waiting for the server.
    pub fn oldest_pending(&self) -> Option<MessageId> {
        self.entries
            .iter()
            .filter(|m| m.optimistic && m.delivery_status == DeliveryStatus::Sent)
            .min_by_key(|m| m.created_at)
            .map(|m| m.id.clone())
    }

    /// Render order: ascending creation time, insertion order on ties.
    pub fn sorted(&self) -> Vec<Message> {
        let mut sorted = self.entries.clone();
        sorted.sort_by_key(|m| m.created_at);
        sorted
    }
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// Added to the open conversation.
    Appended,
    /// Already present in the open conversation.
    Duplicate,
    /// From a peer whose conversation is not open.
    Unread { peer_id: String, reported: Option<u32> },
    /// Not for the open list and not unread (own message elsewhere, or not ours at all).
    Ignored,
}

/// Outgoing delivery in progress.
pub struct SendHandle {
    pub temp_id: MessageId,
    pub peer_id: String,
    task: JoinHandle<DeliveryStatus>,
}

impl SendHandle {
    pub async fn outcome(self) -> DeliveryStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                error!("Delivery task for {} did not finish: {}", self.temp_id, e);
                DeliveryStatus::Error
            }
        }
    }
}

#[derive(Default)]
struct SyncState {
    active_peer: Option<String>,
    conversations: HashMap<String, MessageList>,
    pages_loaded: HashMap<String, PageRequest>,
    sending: bool,
}

#[derive(Clone)]
pub struct MessageSyncEngine {
    me: UserRef,
    channel: Arc<dyn RealtimeChannel>,
    api: Arc<dyn MessageApi>,
    fallback_timeout: Duration,
    page_size: u32,
    state: Arc<Mutex<SyncState>>,
}

impl MessageSyncEngine {
    pub fn new(
        me: UserRef,
        channel: Arc<dyn RealtimeChannel>,
        api: Arc<dyn MessageApi>,
        fallback_timeout: Duration,
        page_size: u32,
    ) -> Self {
        MessageSyncEngine {
            me,
            channel,
            api,
            fallback_timeout,
            page_size,
            state: Arc::new(Mutex::new(SyncState::default())),
        }
    }

    pub fn me(&self) -> &UserRef {
        &self.me
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SyncState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn active_peer(&self) -> Option<String> {
        self.with_state(|state| state.active_peer.clone())
    }

    pub fn set_active_peer(&self, peer_id: Option<&str>) {
        self.with_state(|state| {
            state.active_peer = peer_id.map(str::to_string);
            if let Some(peer) = peer_id {
                state.conversations.entry(peer.to_string()).or_default();
            }
        });
    }

    pub fn is_sending(&self) -> bool {
        self.with_state(|state| state.sending)
    }

    /// The open conversation in render order.
    pub fn visible_messages(&self) -> Vec<Message> {
        self.with_state(|state| {
            state
                .active_peer
                .as_ref()
                .and_then(|peer| state.conversations.get(peer))
                .map(MessageList::sorted)
                .unwrap_or_default()
        })
    }

    pub fn messages_with(&self, peer_id: &str) -> Vec<Message> {
        self.with_state(|state| {
            state
                .conversations
                .get(peer_id)
                .map(MessageList::sorted)
                .unwrap_or_default()
        })
    }

    pub fn find(&self, peer_id: &str, id: &MessageId) -> Option<Message> {
        self.with_state(|state| state.conversations.get(peer_id).and_then(|list| list.get(id).cloned()))
    }

    /// Load the first history page of `peer_id` unless already loaded.
    pub async fn load_history(&self, peer_id: &str) -> SyncResult<usize> {
        if self.with_state(|state| state.pages_loaded.contains_key(peer_id)) {
            return Ok(0);
        }
        self.fetch_page(peer_id, PageRequest::first(self.page_size)).await
    }

    /// Load the next, older history page of `peer_id`.
    pub async fn load_older(&self, peer_id: &str) -> SyncResult<usize> {
        let page = self.with_state(|state| {
            state
                .pages_loaded
                .get(peer_id)
                .map(|page| page.next())
                .unwrap_or_else(|| PageRequest::first(self.page_size))
        });
        self.fetch_page(peer_id, page).await
    }

    async fn fetch_page(&self, peer_id: &str, page: PageRequest) -> SyncResult<usize> {
        let messages = self.api.fetch_conversation(peer_id, page).await?;
        let me = self.me.id.clone();
        let added = self.with_state(|state| {
            state.pages_loaded.insert(peer_id.to_string(), page);
            let list = state.conversations.entry(peer_id.to_string()).or_default();
            list.merge(messages.into_iter().filter(|m| m.is_between(&me, peer_id)).collect())
        });
        debug!("Loaded page {} with {} new messages for {}", page.page, added, peer_id);
        Ok(added)
    }

    /// Send `text` to the open conversation. The optimistic entry is visible
    /// when this returns; delivery continues in the background.
    pub fn submit(&self, text: &str) -> SyncResult<SendHandle> {
        let body = text.trim();
        if body.is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let (peer_id, temp_id) = self.with_state(|state| {
            let peer_id = state.active_peer.clone().ok_or(SyncError::NoActiveConversation)?;
            if state.sending {
                return Err(SyncError::SendInProgress);
            }

            let now = Utc::now();
            let list = state.conversations.entry(peer_id.clone()).or_default();
            let mut stamp = now;
            let mut temp_id = MessageId::temp(stamp);
            while list.contains(&temp_id) {
                stamp += chrono::Duration::milliseconds(1);
                temp_id = MessageId::temp(stamp);
            }
            list.insert(Message::optimistic(temp_id.clone(), &self.me, &peer_id, body, now));
            state.sending = true;
            Ok((peer_id, temp_id))
        })?;

        info!("Queued {} for {}", temp_id, peer_id);
        Ok(self.spawn_delivery(peer_id, temp_id, body.to_string()))
    }

    /// Manually retry a message that ended in `Error`.
    pub fn resend(&self, temp_id: &MessageId) -> SyncResult<SendHandle> {
        let (peer_id, body) = self.with_state(|state| {
            if state.sending {
                return Err(SyncError::SendInProgress);
            }
            let (peer_id, list) = state
                .conversations
                .iter_mut()
                .find(|(_, list)| {
                    list.get(temp_id)
                        .map(|m| m.delivery_status == DeliveryStatus::Error)
                        .unwrap_or(false)
                })
                .ok_or_else(|| SyncError::UnknownMessage(temp_id.to_string()))?;
            let body = list.get(temp_id).map(|m| m.content.clone()).unwrap_or_default();
            list.set_status(temp_id, DeliveryStatus::Sent);
            let peer_id = peer_id.clone();
            state.sending = true;
            Ok((peer_id, body))
        })?;

        info!("Resending {} to {}", temp_id, peer_id);
        Ok(self.spawn_delivery(peer_id, temp_id.clone(), body))
    }

    fn spawn_delivery(&self, peer_id: String, temp_id: MessageId, body: String) -> SendHandle {
        let engine = self.clone();
        let task_peer = peer_id.clone();
        let task_temp = temp_id.clone();
        let task = tokio::spawn(async move {
            let status = engine.deliver(&task_peer, &task_temp, &body).await;
            engine.with_state(|state| state.sending = false);
            status
        });
        SendHandle { temp_id, peer_id, task }
    }

    async fn deliver(&self, peer_id: &str, temp_id: &MessageId, body: &str) -> DeliveryStatus {
        if self.channel.is_connected() {
            match self.send_over_socket(peer_id, body).await {
                Ok(confirmed) => {
                    info!("{} confirmed over socket as {}", temp_id, confirmed.id);
                    return self.confirm(peer_id, temp_id, confirmed);
                }
                Err(e) => warn!("Socket delivery of {} failed ({}), falling back to REST", temp_id, e),
            }
            if !self.is_pending(peer_id, temp_id) {
                debug!("{} is no longer pending, skipping REST fallback", temp_id);
                return self
                    .find(peer_id, temp_id)
                    .map(|m| m.delivery_status)
                    .unwrap_or(DeliveryStatus::Delivered);
            }
        } else {
            info!("Realtime connection down, sending {} over REST", temp_id);
        }

        let draft = NewMessage {
            receiver_id: peer_id.to_string(),
            content: body.to_string(),
        };
        match self.api.create_message(&draft).await {
            Ok(confirmed) => {
                info!("{} confirmed over REST as {}", temp_id, confirmed.id);
                self.confirm(peer_id, temp_id, confirmed)
            }
            Err(e) => {
                error!("Failed to deliver {} to {}: {}", temp_id, peer_id, e);
                self.with_state(|state| {
                    if let Some(list) = state.conversations.get_mut(peer_id) {
                        list.set_status(temp_id, DeliveryStatus::Error);
                    }
                });
                DeliveryStatus::Error
            }
        }
    }

    /// Emit with ack and wait at most the fallback timeout for the answer.
    async fn send_over_socket(&self, peer_id: &str, body: &str) -> SyncResult<Message> {
        let attempt = async {
            let ack = self
                .channel
                .emit_with_ack(names::SEND_MESSAGE, json!({ "receiverId": peer_id, "content": body }))
                .await?;
            let value = ack.wait().await?;
            parse_send_ack(&value)
        };
        match tokio::time::timeout(self.fallback_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::AckDropped(format!(
                "{} (no answer within {:?})",
                names::SEND_MESSAGE,
                self.fallback_timeout
            ))),
        }
    }

    fn is_pending(&self, peer_id: &str, temp_id: &MessageId) -> bool {
        self.find(peer_id, temp_id)
            .map(|m| m.optimistic && m.delivery_status == DeliveryStatus::Sent)
            .unwrap_or(false)
    }

    fn confirm(&self, peer_id: &str, temp_id: &MessageId, confirmed: Message) -> DeliveryStatus {
        self.with_state(|state| {
            state
                .conversations
                .entry(peer_id.to_string())
                .or_default()
                .confirm(temp_id, confirmed);
        });
        DeliveryStatus::Delivered
    }

    /// Route an inbound message: into the open list (deduplicated by id) or
    /// back to the caller as an unread for another conversation.
    pub fn handle_inbound(&self, message: Message, reported_unread: Option<u32>) -> InboundOutcome {
        let me = self.me.id.clone();
        if message.sender_id != me && message.receiver_id != me {
            warn!("Ignoring message {} that is neither from nor to us", message.id);
            return InboundOutcome::Ignored;
        }
        let peer_id = message.peer_of(&me).to_string();
        let from_peer = message.sender_id != me;

        self.with_state(|state| {
            if state.active_peer.as_deref() == Some(peer_id.as_str()) {
                let list = state.conversations.entry(peer_id.clone()).or_default();
                if list.insert(message) {
                    InboundOutcome::Appended
                } else {
                    InboundOutcome::Duplicate
                }
            } else if from_peer {
                InboundOutcome::Unread {
                    peer_id,
                    reported: reported_unread,
                }
            } else {
                InboundOutcome::Ignored
            }
        })
    }

    /// A `messageError` event: fail the named entry, or the oldest pending
    /// one of the open conversation when no id is given.
    pub fn handle_message_error(&self, temp_id: Option<&str>, reason: &str) -> Option<MessageId> {
        self.with_state(|state| {
            let peer = state.active_peer.clone()?;
            let list = state.conversations.get_mut(&peer)?;
            let target = match temp_id {
                Some(id) => {
                    let id = MessageId::Temp(id.to_string());
                    list.contains(&id).then_some(id)
                }
                None => list.oldest_pending(),
            }?;
            warn!("Server reported an error for {}: {}", target, reason);
            list.set_status(&target, DeliveryStatus::Error);
            Some(target)
        })
    }
}
