//! Connection registry and routing primitives.
//!
//! ```text
//!                       ┌──────────────── Hub ────────────────┐
//!  Client (conv A) ──┐  │ conversations: conv ─► {conn ─► Peer}│
//!  Client (conv A) ──┼─►│ agent slot      ─► Peer              │
//!  Client (conv B) ──┘  │ voice slot      ─► Peer              │
//!                       │ assistant slot  ─► Peer (+tools)     │
//!                       │ monitors: {conn ─► Peer}             │
//!                       └──────────────────────────────────────┘
//!                                    │ every routed frame
//!                                    ▼
//!                          MonitorFrame {src, dst, data}
//! ```
//!
//! Each table has its own lock. Fan-out snapshots the recipients under a
//! read lock and writes after releasing it. A recipient whose write fails or
//! exceeds the write deadline is evicted; the caller is never told.

pub mod peer;
pub mod slot;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{AssistantTool, MonitorFrame};

pub use peer::{Peer, PeerRole, SendFailure};
pub use slot::ExclusiveSlot;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot of hub occupancy and traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub conversations: usize,
    pub subscribers: usize,
    pub monitors: usize,
    pub agent_connected: bool,
    pub voice_connected: bool,
    pub assistant_connected: bool,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_mirrored: u64,
    pub evictions: u64,
}

/// Lock-free counters, read via [`Hub::stats`].
#[derive(Default)]
struct AtomicHubStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_mirrored: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Default)]
struct AssistantState {
    tools: Vec<AssistantTool>,
    last_heartbeat: Option<DateTime<Utc>>,
}

pub struct Hub {
    conversations: RwLock<HashMap<String, HashMap<Uuid, Peer>>>,
    agent: ExclusiveSlot<Peer>,
    voice: ExclusiveSlot<Peer>,
    assistant: ExclusiveSlot<Peer>,
    assistant_state: RwLock<AssistantState>,
    monitors: RwLock<HashMap<Uuid, Peer>>,
    write_timeout: Duration,
    stats: AtomicHubStats,
}

impl Hub {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            agent: ExclusiveSlot::new(),
            voice: ExclusiveSlot::new(),
            assistant: ExclusiveSlot::new(),
            assistant_state: RwLock::new(AssistantState::default()),
            monitors: RwLock::new(HashMap::new()),
            write_timeout,
            stats: AtomicHubStats::default(),
        }
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    // ─── Conversation subscribers ─────────────────────────────────────

    /// Add `peer` to a conversation. Re-subscribing the same connection is a no-op.
    pub async fn subscribe(&self, conversation_id: &str, peer: Peer) {
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .insert(peer.id(), peer);
        log::debug!("Client subscribed to conversation {conversation_id}");
    }

    pub async fn unsubscribe(&self, conversation_id: &str, conn_id: Uuid) -> bool {
        let mut conversations = self.conversations.write().await;
        let Some(subscribers) = conversations.get_mut(conversation_id) else {
            return false;
        };
        let removed = subscribers.remove(&conn_id).is_some();
        if subscribers.is_empty() {
            conversations.remove(conversation_id);
        }
        removed
    }

    /// Remove a connection from every conversation. Returns how many it left.
    pub async fn unsubscribe_all(&self, conn_id: Uuid) -> usize {
        let mut conversations = self.conversations.write().await;
        let mut removed = 0;
        conversations.retain(|_, subscribers| {
            if subscribers.remove(&conn_id).is_some() {
                removed += 1;
            }
            !subscribers.is_empty()
        });
        removed
    }

    pub async fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map_or(0, HashMap::len)
    }

    pub async fn is_subscribed(&self, conversation_id: &str, conn_id: Uuid) -> bool {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .is_some_and(|subscribers| subscribers.contains_key(&conn_id))
    }

    // ─── Exclusive roles ──────────────────────────────────────────────

    fn slot(&self, role: PeerRole) -> Option<&ExclusiveSlot<Peer>> {
        match role {
            PeerRole::Agent => Some(&self.agent),
            PeerRole::Voice => Some(&self.voice),
            PeerRole::Assistant => Some(&self.assistant),
            _ => None,
        }
    }

    async fn claim(&self, role: PeerRole, peer: Peer) {
        let Some(slot) = self.slot(role) else {
            return;
        };
        let id = peer.id();
        if let Some(previous) = slot.claim(peer).await {
            log::info!("{role} connection {} replaced by {id}", previous.id());
        } else {
            log::info!("{role} connected ({id})");
        }
    }

    async fn release(&self, role: PeerRole, conn_id: Uuid) -> bool {
        let Some(slot) = self.slot(role) else {
            return false;
        };
        let released = slot.release_if(|holder| holder.id() == conn_id).await;
        if released {
            log::info!("{role} disconnected ({conn_id})");
            if role == PeerRole::Assistant {
                *self.assistant_state.write().await = AssistantState::default();
            }
        }
        released
    }

    pub async fn subscribe_agent(&self, peer: Peer) {
        self.claim(PeerRole::Agent, peer).await;
    }

    pub async fn subscribe_voice(&self, peer: Peer) {
        self.claim(PeerRole::Voice, peer).await;
    }

    pub async fn subscribe_assistant(&self, peer: Peer) {
        self.claim(PeerRole::Assistant, peer).await;
    }

    /// Clear the agent slot if `conn_id` still holds it.
    pub async fn unsubscribe_agent(&self, conn_id: Uuid) -> bool {
        self.release(PeerRole::Agent, conn_id).await
    }

    pub async fn unsubscribe_voice(&self, conn_id: Uuid) -> bool {
        self.release(PeerRole::Voice, conn_id).await
    }

    /// Also forgets the registered tools and heartbeat.
    pub async fn unsubscribe_assistant(&self, conn_id: Uuid) -> bool {
        self.release(PeerRole::Assistant, conn_id).await
    }

    /// Connection id currently holding `role`'s slot.
    pub async fn holder(&self, role: PeerRole) -> Option<Uuid> {
        match self.slot(role) {
            Some(slot) => slot.current().await.map(|peer| peer.id()),
            None => None,
        }
    }

    // ─── Assistant bookkeeping ────────────────────────────────────────

    pub async fn set_assistant_tools(&self, tools: Vec<AssistantTool>) {
        self.assistant_state.write().await.tools = tools;
    }

    pub async fn assistant_tools(&self) -> Vec<AssistantTool> {
        self.assistant_state.read().await.tools.clone()
    }

    pub async fn record_assistant_heartbeat(&self) {
        self.assistant_state.write().await.last_heartbeat = Some(Utc::now());
    }

    pub async fn last_assistant_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.assistant_state.read().await.last_heartbeat
    }

    // ─── Monitors ─────────────────────────────────────────────────────

    pub async fn subscribe_monitor(&self, peer: Peer) {
        log::info!("Monitor connected ({})", peer.id());
        self.monitors.write().await.insert(peer.id(), peer);
    }

    pub async fn unsubscribe_monitor(&self, conn_id: Uuid) -> bool {
        self.monitors.write().await.remove(&conn_id).is_some()
    }

    // ─── Sending ──────────────────────────────────────────────────────

    /// Send to every subscriber of a conversation. Returns the number of
    /// successful deliveries; failed subscribers are evicted.
    pub async fn broadcast_to_conversation(&self, conversation_id: &str, frame: Arc<Vec<u8>>) -> usize {
        let recipients: Vec<Peer> = {
            let conversations = self.conversations.read().await;
            match conversations.get(conversation_id) {
                Some(subscribers) => subscribers.values().cloned().collect(),
                None => Vec::new(),
            }
        };

        if recipients.is_empty() {
            log::debug!("No subscribers for conversation {conversation_id}");
        }

        let results = join_all(
            recipients
                .iter()
                .map(|peer| peer.send(frame.clone(), self.write_timeout)),
        )
        .await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (peer, result) in recipients.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!(
                        "Evicting subscriber {} from conversation {conversation_id}: {e}",
                        peer.id()
                    );
                    failed.push(peer.id());
                }
            }
        }

        self.stats.frames_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        if !failed.is_empty() {
            self.stats.frames_dropped.fetch_add(failed.len() as u64, Ordering::Relaxed);
            for conn_id in failed {
                if self.unsubscribe(conversation_id, conn_id).await {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.mirror(PeerRole::Server, PeerRole::Client, &frame).await;
        delivered
    }

    pub async fn send_to_agent(&self, frame: Arc<Vec<u8>>) -> bool {
        self.send_to_role(PeerRole::Agent, frame).await
    }

    pub async fn send_to_voice(&self, frame: Arc<Vec<u8>>) -> bool {
        self.send_to_role(PeerRole::Voice, frame).await
    }

    pub async fn send_to_assistant(&self, frame: Arc<Vec<u8>>) -> bool {
        self.send_to_role(PeerRole::Assistant, frame).await
    }

    /// Preference changes go to both workers that act on them.
    pub async fn broadcast_preferences(&self, frame: Arc<Vec<u8>>) {
        self.send_to_agent(frame.clone()).await;
        self.send_to_voice(frame).await;
    }

    async fn send_to_role(&self, role: PeerRole, frame: Arc<Vec<u8>>) -> bool {
        let Some(slot) = self.slot(role) else {
            return false;
        };
        self.mirror(PeerRole::Server, role, &frame).await;
        let Some(peer) = slot.current().await else {
            log::warn!("No {role} connected, dropping frame");
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let result = peer.send(frame, self.write_timeout).await;

        match result {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::warn!("Evicting {role} connection {}: {e}", peer.id());
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                if self.release(role, peer.id()).await {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                false
            }
        }
    }

    /// Deadline-bounded write straight to one connection, not mirrored.
    pub async fn reply(&self, peer: &Peer, frame: Arc<Vec<u8>>) -> bool {
        match peer.send(frame, self.write_timeout).await {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::warn!("Reply to {} failed: {e}", peer.id());
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Copy `frame` to every monitor as `{src, dst, data}`.
    pub async fn mirror(&self, src: PeerRole, dst: PeerRole, frame: &[u8]) {
        let monitors: Vec<Peer> = self.monitors.read().await.values().cloned().collect();
        if monitors.is_empty() {
            return;
        }

        let encoded = match (MonitorFrame {
            src: src.as_str().to_string(),
            dst: dst.as_str().to_string(),
            data: frame.to_vec(),
        })
        .encode()
        {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("Failed to encode monitor frame: {e}");
                return;
            }
        };

        let results = join_all(
            monitors
                .iter()
                .map(|peer| peer.send(encoded.clone(), self.write_timeout)),
        )
        .await;

        for (peer, result) in monitors.iter().zip(results) {
            match result {
                Ok(()) => {
                    self.stats.frames_mirrored.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("Evicting monitor {}: {e}", peer.id());
                    if self.unsubscribe_monitor(peer.id()).await {
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    pub async fn stats(&self) -> HubStats {
        let (conversations, subscribers) = {
            let conversations = self.conversations.read().await;
            (
                conversations.len(),
                conversations.values().map(HashMap::len).sum(),
            )
        };
        HubStats {
            conversations,
            subscribers,
            monitors: self.monitors.read().await.len(),
            agent_connected: self.agent.is_held().await,
            voice_connected: self.voice.is_held().await,
            assistant_connected: self.assistant.is_held().await,
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            frames_mirrored: self.stats.frames_mirrored.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn hub() -> Hub {
        Hub::new(Duration::from_millis(50))
    }

    fn frame(bytes: &[u8]) -> Arc<Vec<u8>> {
        Arc::new(bytes.to_vec())
    }

    #[tokio::test]
    async fn test_broadcast_evicts_only_failing_subscriber() {
        let hub = hub();
        let (a, mut rx_a) = Peer::channel(8);
        let (b, mut rx_b) = Peer::channel(8);
        let (c, rx_c) = Peer::channel(8);
        let failing = c.id();
        drop(rx_c);

        for peer in [a, b, c] {
            hub.subscribe("conv_1", peer).await;
        }

        let delivered = hub.broadcast_to_conversation("conv_1", frame(b"hello")).await;

        assert_eq!(delivered, 2);
        assert_eq!(*rx_a.recv().await.unwrap(), b"hello".to_vec());
        assert_eq!(*rx_b.recv().await.unwrap(), b"hello".to_vec());
        assert_eq!(hub.subscriber_count("conv_1").await, 2);
        assert!(!hub.is_subscribed("conv_1", failing).await);
        assert_eq!(hub.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted_after_deadline() {
        let hub = hub();
        let (slow, _rx_slow) = Peer::channel(1);
        let slow_id = slow.id();
        hub.subscribe("conv_1", slow).await;

        assert_eq!(hub.broadcast_to_conversation("conv_1", frame(b"1")).await, 1);
        // Queue is full and nobody drains it.
        assert_eq!(hub.broadcast_to_conversation("conv_1", frame(b"2")).await, 0);
        assert!(!hub.is_subscribed("conv_1", slow_id).await);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_deduplicated() {
        let hub = hub();
        let (peer, _rx) = Peer::channel(8);
        hub.subscribe("conv_1", peer.clone()).await;
        hub.subscribe("conv_1", peer).await;
        assert_eq!(hub.subscriber_count("conv_1").await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_drops_empty_conversations() {
        let hub = hub();
        let (peer, _rx) = Peer::channel(8);
        let (other, _rx_other) = Peer::channel(8);
        hub.subscribe("conv_1", peer.clone()).await;
        hub.subscribe("conv_2", peer.clone()).await;
        hub.subscribe("conv_2", other).await;

        assert_eq!(hub.unsubscribe_all(peer.id()).await, 2);
        let stats = hub.stats().await;
        assert_eq!(stats.conversations, 1);
        assert_eq!(stats.subscribers, 1);
    }

    #[tokio::test]
    async fn test_monitor_sees_exact_bytes() {
        let hub = hub();
        let (monitor, mut rx_monitor) = Peer::channel(8);
        hub.subscribe_monitor(monitor).await;
        let (agent, mut rx_agent) = Peer::channel(8);
        hub.subscribe_agent(agent).await;

        let payload = frame(&[9, 8, 7, 6]);
        assert!(hub.send_to_agent(payload.clone()).await);
        assert_eq!(rx_agent.recv().await.unwrap(), payload);

        let mirrored = MonitorFrame::decode(&rx_monitor.recv().await.unwrap()).unwrap();
        assert_eq!(mirrored.src, "server");
        assert_eq!(mirrored.dst, "agent");
        assert_eq!(mirrored.data, *payload);
    }

    #[tokio::test]
    async fn test_send_to_empty_slot_is_dropped_but_mirrored() {
        let hub = hub();
        let (monitor, mut rx_monitor) = Peer::channel(8);
        hub.subscribe_monitor(monitor).await;

        let payload = frame(b"orphan");
        assert!(!hub.send_to_voice(payload.clone()).await);

        let mirrored = MonitorFrame::decode(&rx_monitor.recv().await.unwrap()).unwrap();
        assert_eq!(mirrored.src, "server");
        assert_eq!(mirrored.dst, "voice");
        assert_eq!(mirrored.data, *payload);
        assert_eq!(hub.stats().await.frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_broadcast_is_mirrored_once() {
        let hub = hub();
        let (monitor, mut rx_monitor) = Peer::channel(8);
        hub.subscribe_monitor(monitor).await;
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (peer, rx) = Peer::channel(8);
            receivers.push(rx);
            hub.subscribe("conv_1", peer).await;
        }

        hub.broadcast_to_conversation("conv_1", frame(b"x")).await;

        let mirrored = MonitorFrame::decode(&rx_monitor.recv().await.unwrap()).unwrap();
        assert_eq!(mirrored.dst, "client");
        assert!(rx_monitor.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_agent_last_writer_wins() {
        let hub = hub();
        let (old, mut rx_old) = Peer::channel(8);
        let (new, mut rx_new) = Peer::channel(8);
        let old_id = old.id();
        hub.subscribe_agent(old).await;
        hub.subscribe_agent(new.clone()).await;

        assert!(hub.send_to_agent(frame(b"job")).await);
        assert_eq!(*rx_new.recv().await.unwrap(), b"job".to_vec());
        assert!(rx_old.try_recv().is_err());

        // The replaced connection going away leaves the new holder alone.
        assert!(!hub.unsubscribe_agent(old_id).await);
        assert_eq!(hub.holder(PeerRole::Agent).await, Some(new.id()));
    }

    #[tokio::test]
    async fn test_failed_slot_write_evicts_holder() {
        let hub = hub();
        let (voice, rx) = Peer::channel(8);
        drop(rx);
        hub.subscribe_voice(voice).await;

        assert!(!hub.send_to_voice(frame(b"x")).await);
        assert!(!hub.stats().await.voice_connected);
    }

    #[tokio::test]
    async fn test_assistant_release_clears_tools() {
        let hub = hub();
        let (assistant, _rx) = Peer::channel(8);
        let id = assistant.id();
        hub.subscribe_assistant(assistant).await;
        hub.set_assistant_tools(vec![AssistantTool {
            name: "flashlight".into(),
            description: "Toggle the flashlight".into(),
            input_schema: None,
        }])
        .await;
        hub.record_assistant_heartbeat().await;
        assert_eq!(hub.assistant_tools().await.len(), 1);

        assert!(hub.unsubscribe_assistant(id).await);
        assert!(hub.assistant_tools().await.is_empty());
        assert!(hub.last_assistant_heartbeat().await.is_none());
    }

    #[tokio::test]
    async fn test_preferences_reach_agent_and_voice() {
        let hub = hub();
        let (agent, mut rx_agent) = Peer::channel(8);
        let (voice, mut rx_voice) = Peer::channel(8);
        hub.subscribe_agent(agent).await;
        hub.subscribe_voice(voice).await;

        hub.broadcast_preferences(frame(b"prefs")).await;

        assert_eq!(*rx_agent.recv().await.unwrap(), b"prefs".to_vec());
        assert_eq!(*rx_voice.recv().await.unwrap(), b"prefs".to_vec());
    }

    #[tokio::test]
    async fn test_dead_monitor_is_evicted() {
        let hub = hub();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        hub.subscribe_monitor(Peer::new(tx)).await;

        hub.mirror(PeerRole::Agent, PeerRole::Server, b"in").await;
        assert_eq!(hub.stats().await.monitors, 0);
    }
}
