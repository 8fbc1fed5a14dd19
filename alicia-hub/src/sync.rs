//! Correlation table that turns pushed agent replies into return values.
//!
//! ```text
//!   caller ── register(conv, user_msg) ──► waiters[(conv, user_msg)]
//!                                             ▲          ▲
//!   StartAnswer {messageId: A, previousId: user_msg} ─── binds A ─┘
//!   ToolUseRequest {messageId: A} ──────────── accumulates under A
//!   AssistantMessage {id: A, previousId: user_msg} ── resolves, removes
//! ```
//!
//! Waiters are keyed by `(conversation_id, user_message_id)`. Tool uses
//! reach their waiter through an assistant-message-id index, filled when
//! the agent announces the answer. A tool use arriving before that
//! announcement binds to the conversation's open waiter only when exactly
//! one is open; otherwise it is dropped.
//!
//! The table never awaits while locked, so a plain mutex guards it and the
//! registration guard can clean up synchronously on drop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::protocol::{AssistantMessage, ErrorBody, ToolUseRequest};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaiterKey {
    pub conversation_id: String,
    pub user_message_id: String,
}

impl WaiterKey {
    pub fn new(conversation_id: impl Into<String>, user_message_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_message_id: user_message_id.into(),
        }
    }
}

/// What a waiter receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Completed {
        message: AssistantMessage,
        tool_uses: Vec<ToolUseRequest>,
    },
    Failed(ErrorBody),
}

struct Waiter {
    token: u64,
    tx: oneshot::Sender<Delivery>,
    /// Tool uses keyed by the assistant message they belong to.
    tool_uses: HashMap<String, Vec<ToolUseRequest>>,
    /// Assistant message ids indexed to this waiter.
    bound: Vec<String>,
}

#[derive(Default)]
struct WaiterTable {
    waiters: HashMap<WaiterKey, Waiter>,
    by_assistant: HashMap<String, WaiterKey>,
    by_conversation: HashMap<String, HashSet<String>>,
}

impl WaiterTable {
    fn insert(&mut self, key: WaiterKey, waiter: Waiter) {
        self.by_conversation
            .entry(key.conversation_id.clone())
            .or_default()
            .insert(key.user_message_id.clone());
        self.waiters.insert(key, waiter);
    }

    fn remove(&mut self, key: &WaiterKey) -> Option<Waiter> {
        let waiter = self.waiters.remove(key)?;
        if let Some(open) = self.by_conversation.get_mut(&key.conversation_id) {
            open.remove(&key.user_message_id);
            if open.is_empty() {
                self.by_conversation.remove(&key.conversation_id);
            }
        }
        for assistant_id in &waiter.bound {
            if self.by_assistant.get(assistant_id) == Some(key) {
                self.by_assistant.remove(assistant_id);
            }
        }
        Some(waiter)
    }

    fn bind(&mut self, assistant_id: &str, key: &WaiterKey) -> bool {
        let Some(waiter) = self.waiters.get_mut(key) else {
            return false;
        };
        if !waiter.bound.iter().any(|id| id == assistant_id) {
            waiter.bound.push(assistant_id.to_string());
        }
        self.by_assistant.insert(assistant_id.to_string(), key.clone());
        true
    }

    /// The only open waiter of a conversation, if there is exactly one.
    fn sole_waiter(&self, conversation_id: &str) -> Option<WaiterKey> {
        let open = self.by_conversation.get(conversation_id)?;
        if open.len() != 1 {
            return None;
        }
        open.iter()
            .next()
            .map(|user_message_id| WaiterKey::new(conversation_id, user_message_id.as_str()))
    }
}

/// Shared table of open synchronous generation calls.
#[derive(Default)]
pub struct SyncWaiters {
    table: Mutex<WaiterTable>,
    next_token: AtomicU64,
}

impl SyncWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, WaiterTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a waiter. Registering a key that is already open replaces the
    /// earlier waiter, whose caller then sees a closed channel.
    pub fn register(self: &Arc<Self>, key: WaiterKey) -> WaiterGuard {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let waiter = Waiter {
            token,
            tx,
            tool_uses: HashMap::new(),
            bound: Vec::new(),
        };

        {
            let mut table = self.table();
            if table.remove(&key).is_some() {
                log::warn!(
                    "Replacing open waiter for {}:{}",
                    key.conversation_id,
                    key.user_message_id
                );
            }
            table.insert(key.clone(), waiter);
        }

        WaiterGuard {
            waiters: Arc::clone(self),
            key,
            token,
            rx: Some(rx),
        }
    }

    /// Link an announced assistant message to the waiter for the user
    /// message it answers.
    pub fn bind_answer(
        &self,
        conversation_id: &str,
        assistant_message_id: &str,
        previous_id: Option<&str>,
    ) -> bool {
        let Some(previous_id) = previous_id else {
            return false;
        };
        let key = WaiterKey::new(conversation_id, previous_id);
        self.table().bind(assistant_message_id, &key)
    }

    /// Buffer a tool use for the waiter its assistant message belongs to.
    pub fn record_tool_use(&self, request: &ToolUseRequest) -> bool {
        let mut table = self.table();

        let key = match table.by_assistant.get(&request.message_id) {
            Some(key) => key.clone(),
            None => match table.sole_waiter(&request.conversation_id) {
                Some(key) => {
                    table.bind(&request.message_id, &key);
                    key
                }
                None => {
                    log::debug!(
                        "No waiter for tool use {} on message {}",
                        request.id,
                        request.message_id
                    );
                    return false;
                }
            },
        };

        match table.waiters.get_mut(&key) {
            Some(waiter) => {
                waiter
                    .tool_uses
                    .entry(request.message_id.clone())
                    .or_default()
                    .push(request.clone());
                true
            }
            None => false,
        }
    }

    /// Deliver an assistant message to the waiter for its parent.
    pub fn resolve(&self, message: &AssistantMessage) -> bool {
        let Some(previous_id) = message.previous_id.as_deref() else {
            return false;
        };
        let key = WaiterKey::new(message.conversation_id.as_str(), previous_id);

        let Some(mut waiter) = self.table().remove(&key) else {
            return false;
        };
        let tool_uses = waiter.tool_uses.remove(&message.id).unwrap_or_default();
        let delivered = waiter
            .tx
            .send(Delivery::Completed {
                message: message.clone(),
                tool_uses,
            })
            .is_ok();
        if delivered {
            log::debug!(
                "Resolved waiter {}:{} with {}",
                key.conversation_id,
                key.user_message_id,
                message.id
            );
        }
        delivered
    }

    /// Deliver an agent error to the waiter it concerns.
    ///
    /// The error's `messageId` may name either the announced assistant
    /// message or the user message itself.
    pub fn fail(&self, error: &ErrorBody) -> bool {
        let Some(message_id) = error.message_id.as_deref() else {
            return false;
        };

        let mut table = self.table();
        let key = match table.by_assistant.get(message_id) {
            Some(key) => key.clone(),
            None => match error.conversation_id.as_deref() {
                Some(conversation_id) => WaiterKey::new(conversation_id, message_id),
                None => return false,
            },
        };
        let Some(waiter) = table.remove(&key) else {
            return false;
        };
        drop(table);

        waiter.tx.send(Delivery::Failed(error.clone())).is_ok()
    }

    fn remove_if_current(&self, key: &WaiterKey, token: u64) {
        let mut table = self.table();
        if table.waiters.get(key).is_some_and(|w| w.token == token) {
            table.remove(key);
        }
    }

    pub fn contains(&self, key: &WaiterKey) -> bool {
        self.table().waiters.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.table().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of assistant-message bindings still indexed.
    pub fn bound_answers(&self) -> usize {
        self.table().by_assistant.len()
    }
}

/// Open registration. Dropping it removes the waiter and anything buffered
/// for it, whichever way the wait ended.
pub struct WaiterGuard {
    waiters: Arc<SyncWaiters>,
    key: WaiterKey,
    token: u64,
    rx: Option<oneshot::Receiver<Delivery>>,
}

impl WaiterGuard {
    pub fn key(&self) -> &WaiterKey {
        &self.key
    }

    /// Wait for delivery. `None` if the waiter was replaced or the table
    /// dropped it without delivering.
    pub async fn recv(&mut self) -> Option<Delivery> {
        let rx = self.rx.as_mut()?;
        let delivery = rx.await.ok();
        self.rx = None;
        delivery
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.waiters.remove_if_current(&self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(id: &str, conv: &str, previous: &str) -> AssistantMessage {
        AssistantMessage {
            id: id.into(),
            conversation_id: conv.into(),
            content: "answer".into(),
            previous_id: Some(previous.into()),
            ..AssistantMessage::default()
        }
    }

    fn tool_use(id: &str, conv: &str, message_id: &str) -> ToolUseRequest {
        ToolUseRequest {
            id: id.into(),
            message_id: message_id.into(),
            conversation_id: conv.into(),
            tool_name: "search".into(),
            ..ToolUseRequest::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_with_bound_tool_uses() {
        let waiters = Arc::new(SyncWaiters::new());
        let mut guard = waiters.register(WaiterKey::new("conv_1", "msg_user"));

        assert!(waiters.bind_answer("conv_1", "msg_asst", Some("msg_user")));
        assert!(waiters.record_tool_use(&tool_use("tu_1", "conv_1", "msg_asst")));
        assert!(waiters.record_tool_use(&tool_use("tu_2", "conv_1", "msg_asst")));
        assert!(waiters.resolve(&assistant("msg_asst", "conv_1", "msg_user")));

        match guard.recv().await {
            Some(Delivery::Completed { message, tool_uses }) => {
                assert_eq!(message.id, "msg_asst");
                let ids: Vec<_> = tool_uses.iter().map(|t| t.id.as_str()).collect();
                assert_eq!(ids, vec!["tu_1", "tu_2"]);
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
        assert!(waiters.is_empty());
        assert_eq!(waiters.bound_answers(), 0);
    }

    #[tokio::test]
    async fn test_unbound_tool_use_uses_sole_waiter() {
        let waiters = Arc::new(SyncWaiters::new());
        let mut guard = waiters.register(WaiterKey::new("conv_1", "msg_user"));

        assert!(waiters.record_tool_use(&tool_use("tu_1", "conv_1", "msg_asst")));
        waiters.resolve(&assistant("msg_asst", "conv_1", "msg_user"));

        let Some(Delivery::Completed { tool_uses, .. }) = guard.recv().await else {
            panic!("expected completion");
        };
        assert_eq!(tool_uses.len(), 1);
    }

    #[test]
    fn test_ambiguous_tool_use_is_dropped() {
        let waiters = Arc::new(SyncWaiters::new());
        let _a = waiters.register(WaiterKey::new("conv_1", "msg_u1"));
        let _b = waiters.register(WaiterKey::new("conv_1", "msg_u2"));

        assert!(!waiters.record_tool_use(&tool_use("tu_1", "conv_1", "msg_asst")));
        assert_eq!(waiters.bound_answers(), 0);
    }

    #[test]
    fn test_prefix_lookalike_ids_do_not_collide() {
        let waiters = Arc::new(SyncWaiters::new());
        let _short = waiters.register(WaiterKey::new("conv_1", "msg_user"));
        let _long = waiters.register(WaiterKey::new("conv_10", "msg_user"));

        assert!(waiters.record_tool_use(&tool_use("tu_1", "conv_1", "msg_a")));
        assert!(waiters.record_tool_use(&tool_use("tu_2", "conv_10", "msg_b")));
        assert_eq!(waiters.bound_answers(), 2);
    }

    #[test]
    fn test_tool_uses_for_other_messages_are_not_delivered() {
        let waiters = Arc::new(SyncWaiters::new());
        let guard = waiters.register(WaiterKey::new("conv_1", "msg_user"));
        waiters.bind_answer("conv_1", "msg_first", Some("msg_user"));
        waiters.record_tool_use(&tool_use("tu_1", "conv_1", "msg_first"));

        let key = guard.key().clone();
        assert!(waiters.contains(&key));
        drop(guard);
        assert!(!waiters.contains(&key));
        assert_eq!(waiters.bound_answers(), 0);
    }

    #[tokio::test]
    async fn test_agent_error_fails_waiter() {
        let waiters = Arc::new(SyncWaiters::new());
        let mut guard = waiters.register(WaiterKey::new("conv_1", "msg_user"));

        let error = ErrorBody {
            code: 500,
            message: "model crashed".into(),
            message_id: Some("msg_user".into()),
            conversation_id: Some("conv_1".into()),
            recoverable: false,
        };
        assert!(waiters.fail(&error));
        assert_eq!(guard.recv().await, Some(Delivery::Failed(error)));
    }

    #[tokio::test]
    async fn test_reregister_replaces_earlier_waiter() {
        let waiters = Arc::new(SyncWaiters::new());
        let key = WaiterKey::new("conv_1", "msg_user");
        let mut first = waiters.register(key.clone());
        let second = waiters.register(key.clone());

        assert_eq!(first.recv().await, None);
        drop(first);
        // The stale guard must not remove its replacement.
        assert!(waiters.contains(&key));
        drop(second);
        assert!(waiters.is_empty());
    }

    #[test]
    fn test_removal_drops_only_own_bindings() {
        let waiters = Arc::new(SyncWaiters::new());
        let first = waiters.register(WaiterKey::new("conv_1", "msg_u1"));
        let second = waiters.register(WaiterKey::new("conv_1", "msg_u2"));

        assert!(waiters.bind_answer("conv_1", "msg_a1", Some("msg_u1")));
        assert!(waiters.bind_answer("conv_1", "msg_a2", Some("msg_u2")));
        // rebinding moves the id to the second waiter
        assert!(waiters.bind_answer("conv_1", "msg_shared", Some("msg_u1")));
        assert!(waiters.bind_answer("conv_1", "msg_shared", Some("msg_u2")));
        assert_eq!(waiters.bound_answers(), 3);

        drop(first);
        assert_eq!(waiters.bound_answers(), 2);
        assert!(waiters.record_tool_use(&tool_use("tu_1", "conv_1", "msg_shared")));

        drop(second);
        assert_eq!(waiters.bound_answers(), 0);
    }

    #[test]
    fn test_resolve_without_waiter_is_noop() {
        let waiters = SyncWaiters::new();
        assert!(!waiters.resolve(&assistant("msg_a", "conv_1", "msg_user")));
    }
}
