// Common test utilities for integration tests
// Recording realtime channel and scripted REST api shared by the test files.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::LevelFilter;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use chatsync::error::{SyncError, SyncResult};
use chatsync::models::{
    ConversationSummary, DeliveryStatus, LastMessage, Message, MessageId, NewMessage, PageRequest,
};
use chatsync::realtime::{Ack, RealtimeChannel};
use chatsync::rest::MessageApi;

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
}

pub fn server_message(id: &str, from: &str, to: &str, seconds: i64) -> Message {
    Message {
        id: MessageId::Server(id.to_string()),
        sender_id: from.to_string(),
        sender_name: from.to_string(),
        receiver_id: to.to_string(),
        content: format!("body of {}", id),
        created_at: at(seconds),
        delivery_status: DeliveryStatus::Delivered,
        optimistic: false,
    }
}

/// Wire form of a message as the backend sends it.
pub fn message_json(id: &str, from: &str, to: &str, content: &str, seconds: i64) -> Value {
    json!({
        "_id": id,
        "senderId": from,
        "receiverId": to,
        "content": content,
        "createdAt": at(seconds).to_rfc3339(),
    })
}

pub fn summary(peer: &str, content: &str, seconds: i64, unread: u32) -> ConversationSummary {
    ConversationSummary {
        peer_id: peer.to_string(),
        peer_name: Some(format!("{} display", peer)),
        avatar_url: None,
        last_message: Some(LastMessage {
            content: content.to_string(),
            created_at: at(seconds),
        }),
        unread_count: unread,
    }
}

/// How the mock channel answers one acknowledged emit.
pub enum AckScript {
    /// Resolve the ack with `value` after `after`.
    Reply { after: Duration, value: Value },
    /// Keep the ack pending forever.
    Never,
    /// Fail the emit itself.
    EmitFails,
}

/// A `RealtimeChannel` that records emits and answers acks from a script.
pub struct MockChannel {
    connected: AtomicBool,
    emitted: Mutex<Vec<(String, Value)>>,
    scripts: Mutex<HashMap<String, VecDeque<AckScript>>>,
    held: Mutex<Vec<oneshot::Sender<Value>>>,
}

impl MockChannel {
    pub fn new(connected: bool) -> Arc<Self> {
        Arc::new(MockChannel {
            connected: AtomicBool::new(connected),
            emitted: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            held: Mutex::new(Vec::new()),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Queue the answer for the next acknowledged emit of `event`.
    /// Unscripted emits never get an answer.
    pub fn script(&self, event: &str, reply: AckScript) {
        self.scripts
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn reply_after(&self, event: &str, millis: u64, value: Value) {
        self.script(
            event,
            AckScript::Reply {
                after: Duration::from_millis(millis),
                value,
            },
        );
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn emitted_names(&self) -> Vec<String> {
        self.emitted().into_iter().map(|(name, _)| name).collect()
    }

    pub fn payloads_of(&self, event: &str) -> Vec<Value> {
        self.emitted()
            .into_iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl RealtimeChannel for MockChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: &str, payload: Value) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.emitted.lock().unwrap().push((event.to_string(), payload));
        Ok(())
    }

    async fn emit_with_ack(&self, event: &str, payload: Value) -> SyncResult<Ack> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.emitted.lock().unwrap().push((event.to_string(), payload));

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(event)
            .and_then(VecDeque::pop_front)
            .unwrap_or(AckScript::Never);
        let (tx, rx) = oneshot::channel();
        match script {
            AckScript::Reply { after, value } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(value);
                });
            }
            AckScript::Never => self.held.lock().unwrap().push(tx),
            AckScript::EmitFails => return Err(SyncError::NotConnected),
        }
        Ok(Ack::new(event, rx))
    }
}

/// A `MessageApi` with canned data and scripted create failures.
pub struct MockApi {
    me: String,
    create_calls: AtomicUsize,
    failing_creates: AtomicUsize,
    created: Mutex<Vec<NewMessage>>,
    conversations: Mutex<HashMap<String, Vec<Message>>>,
    page_requests: Mutex<Vec<(String, PageRequest)>>,
    summaries: Mutex<Vec<ConversationSummary>>,
    user_messages: Mutex<Vec<Message>>,
}

impl MockApi {
    pub fn new(me: &str) -> Arc<Self> {
        Arc::new(MockApi {
            me: me.to_string(),
            create_calls: AtomicUsize::new(0),
            failing_creates: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            conversations: Mutex::new(HashMap::new()),
            page_requests: Mutex::new(Vec::new()),
            summaries: Mutex::new(Vec::new()),
            user_messages: Mutex::new(Vec::new()),
        })
    }

    /// The next `count` create calls fail with a 503.
    pub fn fail_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<NewMessage> {
        self.created.lock().unwrap().clone()
    }

    /// First history page for `peer`; later pages are empty.
    pub fn set_conversation(&self, peer: &str, messages: Vec<Message>) {
        self.conversations.lock().unwrap().insert(peer.to_string(), messages);
    }

    pub fn page_requests(&self) -> Vec<(String, PageRequest)> {
        self.page_requests.lock().unwrap().clone()
    }

    pub fn set_summaries(&self, summaries: Vec<ConversationSummary>) {
        *self.summaries.lock().unwrap() = summaries;
    }

    pub fn set_user_messages(&self, messages: Vec<Message>) {
        *self.user_messages.lock().unwrap() = messages;
    }
}

#[async_trait]
impl MessageApi for MockApi {
    async fn create_message(&self, draft: &NewMessage) -> SyncResult<Message> {
        let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.lock().unwrap().push(draft.clone());

        let failing = self.failing_creates.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_creates.store(failing - 1, Ordering::SeqCst);
            return Err(SyncError::Http {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }

        Ok(Message {
            id: MessageId::Server(format!("rest-{}", call)),
            sender_id: self.me.clone(),
            sender_name: self.me.clone(),
            receiver_id: draft.receiver_id.clone(),
            content: draft.content.clone(),
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Delivered,
            optimistic: false,
        })
    }

    async fn fetch_conversation(&self, peer_id: &str, page: PageRequest) -> SyncResult<Vec<Message>> {
        self.page_requests.lock().unwrap().push((peer_id.to_string(), page));
        if page.page > 1 {
            return Ok(Vec::new());
        }
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .get(peer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        Ok(self.summaries.lock().unwrap().clone())
    }

    async fn fetch_user_messages(&self) -> SyncResult<Vec<Message>> {
        Ok(self.user_messages.lock().unwrap().clone())
    }
}
