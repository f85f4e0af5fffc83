// Typing indicators in both directions
// Outbound: `typing` on the first keystroke, `stopTyping` after an idle pause.
// Inbound: a peer shows as typing until a stop arrives or the display timeout
// runs out, so a dropped stop event cannot leave the indicator stuck.

use log::debug;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::connection::RealtimeChannel;
use super::events::names;

struct IdleTimer {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    inbound: HashMap<String, Instant>,
    outbound: HashMap<String, IdleTimer>,
    generation: u64,
}

#[derive(Clone)]
pub struct TypingTracker {
    channel: Arc<dyn RealtimeChannel>,
    idle_timeout: Duration,
    display_timeout: Duration,
    state: Arc<Mutex<TypingState>>,
}

impl TypingTracker {
    pub fn new(channel: Arc<dyn RealtimeChannel>, idle_timeout: Duration, display_timeout: Duration) -> Self {
        TypingTracker {
            channel,
            idle_timeout,
            display_timeout,
            state: Arc::new(Mutex::new(TypingState::default())),
        }
    }

    /// Local keystroke in the conversation with `peer_id`. Emits `typing` on
    /// the transition into typing and re-arms the idle timer every call.
    pub async fn start_typing(&self, peer_id: &str) {
        let (already_typing, generation) = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            let already_typing = match state.outbound.remove(peer_id) {
                Some(timer) => {
                    timer.task.abort();
                    true
                }
                None => false,
            };
            state.generation += 1;
            (already_typing, state.generation)
        };

        if !already_typing {
            if let Err(e) = self.channel.emit(names::TYPING, json!({ "receiverId": peer_id })).await {
                debug!("Could not signal typing to {}: {}", peer_id, e);
            }
        }

        let tracker = self.clone();
        let peer = peer_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(tracker.idle_timeout).await;
            let still_current = match tracker.state.lock() {
                Ok(mut state) => match state.outbound.get(&peer) {
                    Some(timer) if timer.generation == generation => {
                        state.outbound.remove(&peer);
                        true
                    }
                    _ => false,
                },
                Err(_) => false,
            };
            if still_current {
                debug!("Typing idle for {}, sending stop", peer);
                tracker.emit_stop(&peer).await;
            }
        });

        if let Ok(mut state) = self.state.lock() {
            state.outbound.insert(peer_id.to_string(), IdleTimer { generation, task });
        }
    }

    /// Explicit stop, e.g. when the message is sent. No-op if not typing.
    pub async fn stop_typing(&self, peer_id: &str) {
        let timer = match self.state.lock() {
            Ok(mut state) => state.outbound.remove(peer_id),
            Err(_) => None,
        };
        if let Some(timer) = timer {
            timer.task.abort();
            self.emit_stop(peer_id).await;
        }
    }

    pub fn is_signalling(&self, peer_id: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.outbound.contains_key(peer_id))
            .unwrap_or(false)
    }

    async fn emit_stop(&self, peer_id: &str) {
        if let Err(e) = self.channel.emit(names::STOP_TYPING, json!({ "receiverId": peer_id })).await {
            debug!("Could not signal stop typing to {}: {}", peer_id, e);
        }
    }

    /// Inbound `userTyping`.
    pub fn on_peer_typing(&self, peer_id: &str, typing: bool) {
        if let Ok(mut state) = self.state.lock() {
            if typing {
                state
                    .inbound
                    .insert(peer_id.to_string(), Instant::now() + self.display_timeout);
            } else {
                state.inbound.remove(peer_id);
            }
        }
    }

    pub fn is_typing(&self, peer_id: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .map(|state| state.inbound.get(peer_id).map(|deadline| *deadline > now).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Peers currently shown as typing; expired entries are purged.
    pub fn typing_peers(&self) -> Vec<String> {
        let now = Instant::now();
        match self.state.lock() {
            Ok(mut state) => {
                state.inbound.retain(|_, deadline| *deadline > now);
                let mut peers: Vec<String> = state.inbound.keys().cloned().collect();
                peers.sort();
                peers
            }
            Err(_) => Vec::new(),
        }
    }
}
