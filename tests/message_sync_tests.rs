// Integration tests for optimistic sends, fallback delivery and inbound merging

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use chatsync::error::SyncError;
use chatsync::models::{DeliveryStatus, MessageId, UserRef};
use chatsync::realtime::{names, InboundOutcome, MessageSyncEngine};
use common::{message_json, server_message, setup_logging, AckScript, MockApi, MockChannel};

fn engine(channel: &Arc<MockChannel>, api: &Arc<MockApi>) -> MessageSyncEngine {
    setup_logging();
    MessageSyncEngine::new(
        UserRef::new("alice", "Alice"),
        channel.clone(),
        api.clone(),
        Duration::from_secs(5),
        50,
    )
}

fn success_ack(id: &str, content: &str) -> serde_json::Value {
    json!({ "status": "success", "message": message_json(id, "alice", "bob", content, 1) })
}

#[tokio::test(start_paused = true)]
async fn test_socket_ack_confirms_in_place() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    channel.reply_after(names::SEND_MESSAGE, 200, success_ack("m1", "hi"));
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    let handle = sync.submit("hi").unwrap();
    let visible = sync.visible_messages();
    assert_eq!(visible.len(), 1);
    assert!(visible[0].optimistic);
    assert_eq!(visible[0].delivery_status, DeliveryStatus::Sent);
    assert_eq!(visible[0].id, handle.temp_id);

    assert_eq!(handle.outcome().await, DeliveryStatus::Delivered);
    let visible = sync.visible_messages();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, MessageId::Server("m1".into()));
    assert_eq!(visible[0].delivery_status, DeliveryStatus::Delivered);
    assert_eq!(api.create_calls(), 0);
    assert_eq!(
        channel.payloads_of(names::SEND_MESSAGE),
        vec![json!({ "receiverId": "bob", "content": "hi" })]
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_send_goes_over_rest() {
    let channel = MockChannel::new(false);
    let api = MockApi::new("alice");
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    let handle = sync.submit("hi").unwrap();
    assert_eq!(handle.outcome().await, DeliveryStatus::Delivered);

    let visible = sync.visible_messages();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, MessageId::Server("rest-1".into()));
    assert_eq!(visible[0].delivery_status, DeliveryStatus::Delivered);
    assert!(channel.emitted().is_empty());
    assert_eq!(api.create_calls(), 1);
    assert_eq!(api.created()[0].receiver_id, "bob");
}

#[tokio::test(start_paused = true)]
async fn test_silent_socket_and_failing_rest_ends_in_error() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    api.fail_creates(1);
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    let started = Instant::now();
    let handle = sync.submit("hi").unwrap();
    let temp_id = handle.temp_id.clone();
    assert_eq!(handle.outcome().await, DeliveryStatus::Error);
    assert!(started.elapsed() >= Duration::from_secs(5));

    let visible = sync.visible_messages();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, temp_id);
    assert_eq!(visible[0].delivery_status, DeliveryStatus::Error);
    assert_eq!(api.create_calls(), 1);
    assert!(!sync.is_sending());
}

#[tokio::test(start_paused = true)]
async fn test_late_ack_is_ignored_after_fallback() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    channel.reply_after(names::SEND_MESSAGE, 6000, success_ack("m1", "hi"));
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    let handle = sync.submit("hi").unwrap();
    assert_eq!(handle.outcome().await, DeliveryStatus::Delivered);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let visible = sync.visible_messages();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, MessageId::Server("rest-1".into()));
    assert_eq!(api.create_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_ack_falls_back_without_waiting() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    channel.reply_after(names::SEND_MESSAGE, 10, json!({ "status": "error", "error": "blocked" }));
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    let started = Instant::now();
    let handle = sync.submit("hi").unwrap();
    assert_eq!(handle.outcome().await, DeliveryStatus::Delivered);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(api.create_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_emit_failure_falls_back_to_rest() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    channel.script(names::SEND_MESSAGE, AckScript::EmitFails);
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    let handle = sync.submit("hi").unwrap();
    assert_eq!(handle.outcome().await, DeliveryStatus::Delivered);
    assert_eq!(api.create_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_submit_preconditions() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    let sync = engine(&channel, &api);

    assert!(matches!(sync.submit("hi"), Err(SyncError::NoActiveConversation)));
    sync.set_active_peer(Some("bob"));
    assert!(matches!(sync.submit("   "), Err(SyncError::EmptyMessage)));

    channel.reply_after(names::SEND_MESSAGE, 100, success_ack("m1", "one"));
    let first = sync.submit("one").unwrap();
    assert!(sync.is_sending());
    assert!(matches!(sync.submit("two"), Err(SyncError::SendInProgress)));
    assert_eq!(first.outcome().await, DeliveryStatus::Delivered);

    channel.reply_after(names::SEND_MESSAGE, 100, success_ack("m2", "two"));
    let second = sync.submit("two").unwrap();
    assert_eq!(second.outcome().await, DeliveryStatus::Delivered);
    assert_eq!(sync.visible_messages().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_deduplicated_and_ordered() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    assert_eq!(sync.handle_inbound(server_message("m2", "bob", "alice", 20), None), InboundOutcome::Appended);
    assert_eq!(sync.handle_inbound(server_message("m1", "alice", "bob", 10), None), InboundOutcome::Appended);
    assert_eq!(sync.handle_inbound(server_message("m2", "bob", "alice", 20), None), InboundOutcome::Duplicate);

    let ids: Vec<String> = sync.visible_messages().iter().map(|m| m.id.to_string()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_for_other_conversation_is_unread() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    assert_eq!(
        sync.handle_inbound(server_message("c1", "carol", "alice", 5), Some(2)),
        InboundOutcome::Unread {
            peer_id: "carol".into(),
            reported: Some(2)
        }
    );
    assert_eq!(sync.handle_inbound(server_message("x1", "dave", "erin", 5), None), InboundOutcome::Ignored);
    assert!(sync.visible_messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_echo_before_ack_leaves_one_entry() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    channel.reply_after(names::SEND_MESSAGE, 300, success_ack("m1", "hi"));
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    let handle = sync.submit("hi").unwrap();
    let mut echo = server_message("m1", "alice", "bob", 1);
    echo.content = "hi".into();
    assert_eq!(sync.handle_inbound(echo, None), InboundOutcome::Appended);
    assert_eq!(sync.visible_messages().len(), 2);

    assert_eq!(handle.outcome().await, DeliveryStatus::Delivered);
    let visible = sync.visible_messages();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, MessageId::Server("m1".into()));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_send_survives_conversation_switch() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    channel.reply_after(names::SEND_MESSAGE, 1000, success_ack("m1", "hi"));
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    let handle = sync.submit("hi").unwrap();
    sync.set_active_peer(Some("carol"));
    assert_eq!(handle.outcome().await, DeliveryStatus::Delivered);

    assert!(sync.visible_messages().is_empty());
    let with_bob = sync.messages_with("bob");
    assert_eq!(with_bob.len(), 1);
    assert_eq!(with_bob[0].id, MessageId::Server("m1".into()));
}

#[tokio::test(start_paused = true)]
async fn test_manual_resend_after_error() {
    let channel = MockChannel::new(false);
    let api = MockApi::new("alice");
    api.fail_creates(1);
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    let handle = sync.submit("hi").unwrap();
    let temp_id = handle.temp_id.clone();
    assert_eq!(handle.outcome().await, DeliveryStatus::Error);

    let retry = sync.resend(&temp_id).unwrap();
    assert_eq!(retry.outcome().await, DeliveryStatus::Delivered);
    let visible = sync.visible_messages();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, MessageId::Server("rest-2".into()));

    assert!(matches!(
        sync.resend(&MessageId::Server("rest-2".into())),
        Err(SyncError::UnknownMessage(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_message_error_event_fails_pending_entry_once() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));

    let handle = sync.submit("hi").unwrap();
    let temp_id = handle.temp_id.clone();
    assert_eq!(sync.handle_message_error(None, "rate limited"), Some(temp_id.clone()));
    assert_eq!(sync.find("bob", &temp_id).unwrap().delivery_status, DeliveryStatus::Error);

    // The fallback timer still runs out, but the entry is no longer pending.
    assert_eq!(handle.outcome().await, DeliveryStatus::Error);
    assert_eq!(api.create_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_history_pages_merge_without_duplicates() {
    let channel = MockChannel::new(true);
    let api = MockApi::new("alice");
    api.set_conversation(
        "bob",
        vec![
            server_message("h2", "bob", "alice", 2),
            server_message("h1", "alice", "bob", 1),
            server_message("stray", "carol", "alice", 3),
        ],
    );
    let sync = engine(&channel, &api);
    sync.set_active_peer(Some("bob"));
    sync.handle_inbound(server_message("h2", "bob", "alice", 2), None);

    assert_eq!(sync.load_history("bob").await.unwrap(), 1);
    assert_eq!(sync.load_history("bob").await.unwrap(), 0);
    assert_eq!(sync.load_older("bob").await.unwrap(), 0);

    let ids: Vec<String> = sync.visible_messages().iter().map(|m| m.id.to_string()).collect();
    assert_eq!(ids, vec!["h1", "h2"]);
    let pages: Vec<u32> = api.page_requests().iter().map(|(_, page)| page.page).collect();
    assert_eq!(pages, vec![1, 2]);
    assert_eq!(api.page_requests()[0].1.limit, 50);
}
