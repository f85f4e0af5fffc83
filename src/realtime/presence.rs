// Peer presence tracking
// Fed by the bulk `onlineUsers` snapshot, single-user status deltas and
// `getUserStatus` responses. Merging is last-write-wins: the transport carries
// no sequence numbers, so deltas reordered by network jitter are applied in
// arrival order.

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{HashMap, HashSet};

use crate::models::{PresenceEntry, PresenceStatus};

#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the online set with a full snapshot. Known users missing from
    /// it go offline and keep (or gain) a last-seen time.
    pub fn apply_snapshot(&mut self, online: Vec<PresenceEntry>, now: DateTime<Utc>) {
        let present: HashSet<String> = online.iter().map(|e| e.user_id.clone()).collect();
        for entry in self.entries.values_mut() {
            if entry.status.is_online() && !present.contains(&entry.user_id) {
                entry.status = PresenceStatus::Offline;
                entry.last_seen.get_or_insert(now);
            }
        }
        debug!("Presence snapshot with {} online users", present.len());
        for entry in online {
            self.apply_delta(entry, now);
        }
    }

    /// Insert or overwrite one user's presence.
    pub fn apply_delta(&mut self, mut entry: PresenceEntry, now: DateTime<Utc>) {
        if entry.status == PresenceStatus::Offline {
            let previous = self.entries.get(&entry.user_id).and_then(|e| e.last_seen);
            entry.last_seen = entry.last_seen.or(previous).or(Some(now));
        } else {
            entry.last_seen = None;
        }
        self.entries.insert(entry.user_id.clone(), entry);
    }

    /// Answer to a `getUserStatus` query; merged like any other delta.
    pub fn apply_query_response(&mut self, entry: PresenceEntry, now: DateTime<Utc>) {
        self.apply_delta(entry, now);
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.status_of(user_id).is_online()
    }

    /// Unknown users are reported offline.
    pub fn status_of(&self, user_id: &str) -> PresenceStatus {
        self.entries
            .get(user_id)
            .map(|e| e.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(user_id).and_then(|e| e.last_seen)
    }

    pub fn entry(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.status.is_online())
            .map(|e| e.user_id.clone())
            .collect();
        users.sort();
        users
    }
}
