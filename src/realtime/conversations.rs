// Conversation list projection and unread bookkeeping
// The sidebar is derived on demand from message history, backend summaries,
// live messages and the unread ledger. The ledger only grows through inbound
// messages and only shrinks through mark-read; opening a conversation zeroes
// it optimistically and remembers what to restore if the server says no.

use chrono::{DateTime, Utc};
use log::debug;
use std::cmp::Ordering;
use std::collections::HashMap;

use super::presence::PresenceTracker;
use crate::models::{ConversationPartner, ConversationSummary, LastMessage, Message};

#[derive(Debug, Default)]
pub struct ConversationListProjector {
    me: String,
    active_peer: Option<String>,
    unread: HashMap<String, u32>,
    /// Unread count to restore per peer while a mark-read is in flight.
    pending_reads: HashMap<String, u32>,
    live: HashMap<String, (LastMessage, String)>,
}

struct Row {
    display_name: Option<String>,
    avatar_url: Option<String>,
    last_message: Option<LastMessage>,
    summary_unread: u32,
}

fn is_newer(candidate: &LastMessage, current: Option<&LastMessage>) -> bool {
    match current {
        Some(current) => candidate.created_at > current.created_at,
        None => true,
    }
}

impl ConversationListProjector {
    pub fn new(me: impl Into<String>) -> Self {
        ConversationListProjector {
            me: me.into(),
            ..Default::default()
        }
    }

    pub fn active_peer(&self) -> Option<&str> {
        self.active_peer.as_deref()
    }

    pub fn set_active_peer(&mut self, peer_id: Option<&str>) {
        self.active_peer = peer_id.map(str::to_string);
    }

    /// Raw ledger value, as last acknowledged or reported.
    pub fn unread_count(&self, peer_id: &str) -> u32 {
        self.unread.get(peer_id).copied().unwrap_or(0)
    }

    /// What a badge should show: never anything for the open conversation.
    pub fn badge(&self, peer_id: &str) -> u32 {
        if self.active_peer.as_deref() == Some(peer_id) {
            0
        } else {
            self.unread_count(peer_id)
        }
    }

    /// Take backend counts. A higher backend count wins over the ledger; the
    /// open conversation and peers with a read in flight are left alone.
    pub fn seed_unread(&mut self, summaries: &[ConversationSummary]) {
        for summary in summaries {
            let peer_id = summary.peer_id.as_str();
            if self.active_peer.as_deref() == Some(peer_id) || self.pending_reads.contains_key(peer_id) {
                continue;
            }
            let count = self.unread.entry(summary.peer_id.clone()).or_insert(0);
            *count = (*count).max(summary.unread_count);
        }
    }

    /// An inbound message from `peer_id`. The server's count wins when it is
    /// higher; otherwise the ledger counts the message itself.
    pub fn record_inbound(&mut self, peer_id: &str, reported: Option<u32>) -> u32 {
        if self.active_peer.as_deref() == Some(peer_id) {
            return 0;
        }
        let count = self.unread.entry(peer_id.to_string()).or_insert(0);
        *count = match reported {
            Some(reported) => reported.max(*count + 1),
            None => *count + 1,
        };
        *count
    }

    /// Latest message exchanged live with its peer, kept if newer.
    pub fn record_live_message(&mut self, message: &Message) {
        let peer = message.peer_of(&self.me).to_string();
        let candidate = LastMessage {
            content: message.content.clone(),
            created_at: message.created_at,
        };
        let newer = is_newer(&candidate, self.live.get(&peer).map(|(last, _)| last));
        if newer {
            let name = if message.sender_id == peer {
                message.sender_name.clone()
            } else {
                self.live.get(&peer).map(|(_, name)| name.clone()).unwrap_or_default()
            };
            self.live.insert(peer, (candidate, name));
        }
    }

    /// Optimistic zero on open. Returns the count restored by a rollback.
    pub fn begin_read(&mut self, peer_id: &str) -> u32 {
        let current = self.unread.insert(peer_id.to_string(), 0).unwrap_or(0);
        let prior = self.pending_reads.entry(peer_id.to_string()).or_insert(0);
        *prior += current;
        debug!("Optimistically cleared {} unread for {}", *prior, peer_id);
        *prior
    }

    pub fn has_pending_read(&self, peer_id: &str) -> bool {
        self.pending_reads.contains_key(peer_id)
    }

    pub fn pending_read_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.pending_reads.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn confirm_read(&mut self, peer_id: &str) -> bool {
        self.pending_reads.remove(peer_id).is_some()
    }

    /// Undo the optimistic zero; anything that arrived since is kept on top.
    pub fn rollback_read(&mut self, peer_id: &str) -> Option<u32> {
        let prior = self.pending_reads.remove(peer_id)?;
        let count = self.unread.entry(peer_id.to_string()).or_insert(0);
        *count += prior;
        Some(*count)
    }

    /// Build the sorted, de-duplicated partner list.
    pub fn project(
        &self,
        history: &[Message],
        summaries: &[ConversationSummary],
        presence: &PresenceTracker,
    ) -> Vec<ConversationPartner> {
        let mut rows: HashMap<String, Row> = HashMap::new();
        let blank = || Row {
            display_name: None,
            avatar_url: None,
            last_message: None,
            summary_unread: 0,
        };

        for message in history {
            if message.sender_id != self.me && message.receiver_id != self.me {
                continue;
            }
            let peer = message.peer_of(&self.me).to_string();
            let row = rows.entry(peer.clone()).or_insert_with(blank);
            if message.sender_id == peer && row.display_name.is_none() {
                row.display_name = Some(message.sender_name.clone());
            }
            let candidate = LastMessage {
                content: message.content.clone(),
                created_at: message.created_at,
            };
            if is_newer(&candidate, row.last_message.as_ref()) {
                row.last_message = Some(candidate);
            }
        }

        for summary in summaries {
            let row = rows.entry(summary.peer_id.clone()).or_insert_with(blank);
            if summary.peer_name.is_some() {
                row.display_name = summary.peer_name.clone();
            }
            if summary.avatar_url.is_some() {
                row.avatar_url = summary.avatar_url.clone();
            }
            if let Some(last) = &summary.last_message {
                if is_newer(last, row.last_message.as_ref()) {
                    row.last_message = Some(last.clone());
                }
            }
            row.summary_unread = summary.unread_count;
        }

        for (peer, (last, name)) in &self.live {
            let row = rows.entry(peer.clone()).or_insert_with(blank);
            if row.display_name.is_none() && !name.is_empty() {
                row.display_name = Some(name.clone());
            }
            if is_newer(last, row.last_message.as_ref()) {
                row.last_message = Some(last.clone());
            }
        }

        let mut partners: Vec<ConversationPartner> = rows
            .into_iter()
            .map(|(user_id, row)| {
                let unread_count = if self.active_peer.as_deref() == Some(user_id.as_str()) {
                    0
                } else {
                    self.unread.get(&user_id).copied().unwrap_or(row.summary_unread)
                };
                ConversationPartner {
                    display_name: row.display_name.unwrap_or_else(|| user_id.clone()),
                    avatar_url: row.avatar_url,
                    last_message: row.last_message,
                    unread_count,
                    status: presence.status_of(&user_id),
                    last_seen: presence.last_seen(&user_id),
                    user_id,
                }
            })
            .collect();

        partners.sort_by(compare_partners);
        partners
    }
}

/// Online first, then most recent conversation, then user id.
fn compare_partners(a: &ConversationPartner, b: &ConversationPartner) -> Ordering {
    let stamp = |p: &ConversationPartner| -> Option<DateTime<Utc>> { p.last_message.as_ref().map(|m| m.created_at) };
    b.status
        .is_online()
        .cmp(&a.status.is_online())
        .then_with(|| stamp(b).cmp(&stamp(a)))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryStatus, MessageId, PresenceEntry, PresenceStatus};
    use chrono::Duration;

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::minutes(minutes)
    }

    fn msg(id: &str, from: &str, to: &str, minutes: i64) -> Message {
        Message {
            id: MessageId::Server(id.into()),
            sender_id: from.into(),
            sender_name: format!("{} name", from),
            receiver_id: to.into(),
            content: id.into(),
            created_at: at(minutes),
            delivery_status: DeliveryStatus::Delivered,
            optimistic: false,
        }
    }

    fn summary(peer: &str, content: &str, minutes: i64, unread: u32) -> ConversationSummary {
        ConversationSummary {
            peer_id: peer.into(),
            peer_name: None,
            avatar_url: None,
            last_message: Some(LastMessage {
                content: content.into(),
                created_at: at(minutes),
            }),
            unread_count: unread,
        }
    }

    #[test]
    fn test_history_groups_by_peer() {
        let projector = ConversationListProjector::new("me");
        let history = vec![
            msg("m1", "me", "bob", 1),
            msg("m2", "bob", "me", 2),
            msg("m3", "cat", "me", 3),
            msg("m4", "x", "y", 4),
        ];
        let partners = projector.project(&history, &[], &PresenceTracker::new());

        assert_eq!(partners.len(), 2);
        assert_eq!(partners[0].user_id, "cat");
        assert_eq!(partners[1].user_id, "bob");
        assert_eq!(partners[1].display_name, "bob name");
        assert_eq!(partners[1].last_message.as_ref().unwrap().content, "m2");
    }

    #[test]
    fn test_summary_overrides_only_when_strictly_newer() {
        let projector = ConversationListProjector::new("me");
        let history = vec![msg("old", "bob", "me", 5), msg("cat-hist", "cat", "me", 5)];
        let summaries = vec![summary("bob", "newer summary", 6, 0), summary("cat", "same time", 5, 0)];
        let partners = projector.project(&history, &summaries, &PresenceTracker::new());

        let bob = partners.iter().find(|p| p.user_id == "bob").unwrap();
        let cat = partners.iter().find(|p| p.user_id == "cat").unwrap();
        assert_eq!(bob.last_message.as_ref().unwrap().content, "newer summary");
        assert_eq!(cat.last_message.as_ref().unwrap().content, "cat-hist");
    }

    #[test]
    fn test_online_first_then_recent() {
        let projector = ConversationListProjector::new("me");
        let mut presence = PresenceTracker::new();
        presence.apply_delta(PresenceEntry::new("old-online", PresenceStatus::Online), at(0));
        let summaries = vec![
            summary("recent-offline", "a", 30, 0),
            summary("old-online", "b", 1, 0),
            summary("mid-offline", "c", 10, 0),
        ];
        let order: Vec<String> = projector
            .project(&[], &summaries, &presence)
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(order, vec!["old-online", "recent-offline", "mid-offline"]);
    }

    #[test]
    fn test_active_peer_never_shows_unread() {
        let mut projector = ConversationListProjector::new("me");
        let summaries = vec![summary("bob", "x", 1, 4), summary("cat", "y", 2, 2)];
        projector.seed_unread(&summaries);
        projector.set_active_peer(Some("bob"));

        let partners = projector.project(&[], &summaries, &PresenceTracker::new());
        for partner in &partners {
            if partner.user_id == "bob" {
                assert_eq!(partner.unread_count, 0);
            } else {
                assert_eq!(partner.unread_count, 2);
            }
        }
        assert_eq!(projector.badge("bob"), 0);
        assert_eq!(projector.record_inbound("bob", Some(9)), 0);
    }

    #[test]
    fn test_record_inbound_counts_up() {
        let mut projector = ConversationListProjector::new("me");
        assert_eq!(projector.record_inbound("bob", None), 1);
        assert_eq!(projector.record_inbound("bob", None), 2);
        assert_eq!(projector.record_inbound("bob", Some(7)), 7);
        assert_eq!(projector.record_inbound("bob", Some(3)), 8);
    }

    #[test]
    fn test_begin_read_and_rollback() {
        let mut projector = ConversationListProjector::new("me");
        projector.record_inbound("bob", Some(3));

        assert_eq!(projector.begin_read("bob"), 3);
        assert_eq!(projector.unread_count("bob"), 0);
        assert!(projector.has_pending_read("bob"));

        assert_eq!(projector.rollback_read("bob"), Some(3));
        assert_eq!(projector.unread_count("bob"), 3);
        assert_eq!(projector.rollback_read("bob"), None);
    }

    #[test]
    fn test_rollback_keeps_messages_that_arrived_meanwhile() {
        let mut projector = ConversationListProjector::new("me");
        projector.record_inbound("bob", Some(2));
        projector.begin_read("bob");
        // User moved on before the ack came back.
        projector.set_active_peer(Some("cat"));
        projector.record_inbound("bob", None);
        assert_eq!(projector.rollback_read("bob"), Some(3));
    }

    #[test]
    fn test_confirm_read_clears_pending() {
        let mut projector = ConversationListProjector::new("me");
        projector.record_inbound("bob", None);
        projector.begin_read("bob");
        assert!(projector.confirm_read("bob"));
        assert!(!projector.has_pending_read("bob"));
        assert_eq!(projector.unread_count("bob"), 0);
    }

    #[test]
    fn test_seed_raises_ledger_after_read() {
        let mut projector = ConversationListProjector::new("me");
        projector.record_inbound("bob", None);
        projector.set_active_peer(Some("bob"));
        projector.begin_read("bob");
        projector.confirm_read("bob");
        projector.set_active_peer(Some("cat"));

        let summaries = vec![summary("bob", "sent while offline", 5, 4)];
        projector.seed_unread(&summaries);
        assert_eq!(projector.unread_count("bob"), 4);
        let partners = projector.project(&[], &summaries, &PresenceTracker::new());
        assert_eq!(partners[0].unread_count, 4);

        // A stale lower count never lowers the ledger.
        projector.seed_unread(&[summary("bob", "sent while offline", 5, 1)]);
        assert_eq!(projector.unread_count("bob"), 4);
    }

    #[test]
    fn test_seed_skips_read_in_flight() {
        let mut projector = ConversationListProjector::new("me");
        projector.record_inbound("bob", Some(2));
        projector.set_active_peer(Some("bob"));
        projector.begin_read("bob");
        projector.set_active_peer(Some("cat"));

        projector.seed_unread(&[summary("bob", "x", 1, 2)]);
        assert_eq!(projector.unread_count("bob"), 0);
    }

    #[test]
    fn test_live_message_updates_last_message_and_name() {
        let mut projector = ConversationListProjector::new("me");
        projector.record_live_message(&msg("live", "dan", "me", 50));
        let partners = projector.project(&[], &[summary("dan", "stale", 10, 0)], &PresenceTracker::new());
        assert_eq!(partners[0].last_message.as_ref().unwrap().content, "live");
        assert_eq!(partners[0].display_name, "dan name");
    }
}
