//! Graph operations on top of a [`GraphStore`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::memory::MemoryStore;
use super::model::{Conversation, Message, MessageDraft, ToolUse, ToolUseStatus};
use super::store::GraphStore;
use super::GraphError;

pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 10_000;

/// Where a new message attaches.
#[derive(Clone, Copy)]
enum Parent<'a> {
    /// The conversation's tip as read inside the transaction.
    Tip,
    /// A caller-chosen parent, regardless of the current tip.
    Explicit(Option<&'a str>),
    /// The caller's view of the tip; rejected if the tip has moved.
    ExpectedTip(Option<&'a str>),
}

/// Branch-aware view of the conversation store.
#[derive(Clone)]
pub struct MessageGraph {
    store: Arc<dyn GraphStore>,
    max_chain_depth: usize,
}

impl MessageGraph {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn with_max_chain_depth(mut self, depth: usize) -> Self {
        self.max_chain_depth = depth.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn create_conversation(&self, title: impl Into<String>) -> Result<Conversation, GraphError> {
        let conversation = self.store.create_conversation(Conversation::new(title))?;
        log::debug!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Conversation, GraphError> {
        self.store.get_conversation(id)
    }

    pub fn get_message(&self, id: &str) -> Result<Message, GraphError> {
        self.store.get_message(id)
    }

    /// Append as a child of the current tip and advance the tip, atomically.
    pub fn create_message(
        &self,
        conversation_id: &str,
        draft: MessageDraft,
    ) -> Result<Message, GraphError> {
        self.insert_and_advance(conversation_id, Parent::Tip, draft)
    }

    /// Append under `previous_id` and make the new message the tip.
    ///
    /// Two callers appending under the same parent both succeed and fork.
    pub fn append_message(
        &self,
        conversation_id: &str,
        previous_id: Option<&str>,
        draft: MessageDraft,
    ) -> Result<Message, GraphError> {
        self.insert_and_advance(conversation_id, Parent::Explicit(previous_id), draft)
    }

    /// Append under `expected_tip` only if it is still the tip.
    ///
    /// Returns [`GraphError::TipConflict`] and writes nothing otherwise.
    pub fn append_if_tip(
        &self,
        conversation_id: &str,
        expected_tip: Option<&str>,
        draft: MessageDraft,
    ) -> Result<Message, GraphError> {
        self.insert_and_advance(conversation_id, Parent::ExpectedTip(expected_tip), draft)
    }

    fn insert_and_advance(
        &self,
        conversation_id: &str,
        parent: Parent<'_>,
        draft: MessageDraft,
    ) -> Result<Message, GraphError> {
        let mut created = None;
        self.store.with_tx(&mut |tx| {
            let conversation = tx.get_conversation(conversation_id)?;
            let previous_id = match parent {
                Parent::Tip => conversation.tip_message_id,
                Parent::Explicit(previous) => previous.map(str::to_string),
                Parent::ExpectedTip(expected) => {
                    if conversation.tip_message_id.as_deref() != expected {
                        return Err(GraphError::TipConflict {
                            conversation_id: conversation_id.to_string(),
                            expected: expected.map(str::to_string),
                            actual: conversation.tip_message_id,
                        });
                    }
                    expected.map(str::to_string)
                }
            };

            let message = tx.create_message(draft.clone().into_message(conversation_id, previous_id))?;
            tx.update_conversation_tip(conversation_id, Some(&message.id))?;
            created = Some(message);
            Ok(())
        })?;

        let message =
            created.ok_or_else(|| GraphError::Database("message insert produced no record".into()))?;
        log::debug!(
            "Appended {} message {} to {} (parent {:?}, branch {})",
            message.role.as_str(),
            message.id,
            conversation_id,
            message.previous_id,
            message.branch_index
        );
        Ok(message)
    }

    /// Other messages sharing `message_id`'s parent, ordered by branch index.
    pub fn get_siblings(&self, message_id: &str) -> Result<Vec<Message>, GraphError> {
        let mut siblings = self.store.get_message_siblings(message_id)?;
        siblings.retain(|m| m.id != message_id);
        Ok(siblings)
    }

    /// Every message sharing `message_id`'s parent, itself included.
    pub fn sibling_group(&self, message_id: &str) -> Result<Vec<Message>, GraphError> {
        self.store.get_message_siblings(message_id)
    }

    /// Point the tip at `target_message_id`. The target is not validated.
    pub fn switch_branch(
        &self,
        conversation_id: &str,
        target_message_id: &str,
    ) -> Result<(), GraphError> {
        self.store
            .update_conversation_tip(conversation_id, Some(target_message_id))?;
        log::info!("Conversation {conversation_id} switched to branch at {target_message_id}");
        Ok(())
    }

    /// Walk parent pointers from `tip_message_id`, returned root first.
    ///
    /// A parent id that no longer resolves ends the walk. Revisiting an id
    /// fails with [`GraphError::Cycle`]; more than the configured depth fails
    /// with [`GraphError::ChainTooDeep`].
    pub fn get_chain(&self, tip_message_id: &str) -> Result<Vec<Message>, GraphError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(tip_message_id.to_string());

        while let Some(id) = cursor {
            if !visited.insert(id.clone()) {
                return Err(GraphError::Cycle(id));
            }
            if chain.len() >= self.max_chain_depth {
                return Err(GraphError::ChainTooDeep(tip_message_id.to_string()));
            }

            let message = match self.store.get_message(&id) {
                Ok(message) => message,
                Err(GraphError::NotFound(_)) if !chain.is_empty() => {
                    log::warn!("Chain from {tip_message_id} references missing message {id}");
                    break;
                }
                Err(e) => return Err(e),
            };
            cursor = message.previous_id.clone();
            chain.push(message);
        }

        chain.reverse();
        Ok(chain)
    }

    /// The chain ending at the conversation's tip; empty if there is no tip.
    pub fn active_chain(&self, conversation_id: &str) -> Result<Vec<Message>, GraphError> {
        match self.store.get_conversation(conversation_id)?.tip_message_id {
            Some(tip) => self.get_chain(&tip),
            None => Ok(Vec::new()),
        }
    }

    pub fn create_tool_use(&self, tool_use: ToolUse) -> Result<ToolUse, GraphError> {
        self.store.create_tool_use(tool_use)
    }

    /// Move a pending tool use to success or error.
    pub fn complete_tool_use(
        &self,
        id: &str,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<ToolUse, GraphError> {
        let mut tool_use = self.store.get_tool_use(id)?;
        tool_use.status = if success {
            ToolUseStatus::Success
        } else {
            ToolUseStatus::Error
        };
        tool_use.result = result;
        tool_use.error = error;
        tool_use.completed_at = Some(Utc::now());
        self.store.update_tool_use(&tool_use)?;
        Ok(tool_use)
    }

    pub fn tool_uses_for_message(&self, message_id: &str) -> Result<Vec<ToolUse>, GraphError> {
        self.store.tool_uses_for_message(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::Role;
    use crate::graph::rocks::{RocksStore, StoreConfig};

    fn graph_with_conversation() -> (MessageGraph, String) {
        let graph = MessageGraph::in_memory();
        let conv = graph.create_conversation("test").unwrap();
        (graph, conv.id)
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_sequential_appends_form_linear_chain() {
        let (graph, conv) = graph_with_conversation();
        let mut created = Vec::new();
        for i in 0..5 {
            let draft = if i % 2 == 0 {
                MessageDraft::user(format!("turn {i}"))
            } else {
                MessageDraft::assistant(format!("turn {i}"))
            };
            created.push(graph.create_message(&conv, draft).unwrap());
        }

        let tip = graph.get_conversation(&conv).unwrap().tip_message_id.unwrap();
        assert_eq!(tip, created[4].id);

        let chain = graph.get_chain(&tip).unwrap();
        assert_eq!(ids(&chain), ids(&created));
        assert_eq!(chain[0].previous_id, None);
        assert_eq!(chain[1].role, Role::Assistant);
    }

    #[test]
    fn test_siblings_exclude_self() {
        let (graph, conv) = graph_with_conversation();
        let a = graph.create_message(&conv, MessageDraft::user("A")).unwrap();
        let b = graph
            .append_message(&conv, Some(&a.id), MessageDraft::assistant("B"))
            .unwrap();
        let c = graph
            .append_message(&conv, Some(&a.id), MessageDraft::assistant("C"))
            .unwrap();

        assert_eq!(ids(&graph.get_siblings(&b.id).unwrap()), vec![c.id.as_str()]);
        assert_eq!(ids(&graph.get_siblings(&c.id).unwrap()), vec![b.id.as_str()]);
        assert!(graph.get_siblings(&a.id).unwrap().is_empty());
        assert_eq!(graph.sibling_group(&b.id).unwrap().len(), 2);
    }

    #[test]
    fn test_switch_branch_changes_active_chain() {
        let (graph, conv) = graph_with_conversation();
        let a = graph.create_message(&conv, MessageDraft::user("A")).unwrap();
        let c = graph
            .append_message(&conv, Some(&a.id), MessageDraft::assistant("C"))
            .unwrap();
        let b = graph
            .append_message(&conv, Some(&a.id), MessageDraft::assistant("B"))
            .unwrap();
        assert_eq!(
            graph.get_conversation(&conv).unwrap().tip_message_id.as_deref(),
            Some(b.id.as_str())
        );

        graph.switch_branch(&conv, &c.id).unwrap();

        let chain = graph.active_chain(&conv).unwrap();
        assert_eq!(ids(&chain), vec![a.id.as_str(), c.id.as_str()]);
    }

    #[test]
    fn test_switch_branch_does_not_validate_target() {
        let (graph, conv) = graph_with_conversation();
        graph.switch_branch(&conv, "msg_elsewhere").unwrap();
        assert_eq!(
            graph.get_conversation(&conv).unwrap().tip_message_id.as_deref(),
            Some("msg_elsewhere")
        );
        assert!(matches!(graph.active_chain(&conv), Err(GraphError::NotFound(_))));
    }

    #[test]
    fn test_empty_conversation_has_empty_chain() {
        let (graph, conv) = graph_with_conversation();
        assert!(graph.active_chain(&conv).unwrap().is_empty());
    }

    #[test]
    fn test_cycle_is_detected() {
        let (graph, conv) = graph_with_conversation();
        let store = graph.store();
        store
            .create_message(
                MessageDraft::user("a")
                    .with_id("msg_a")
                    .into_message(&conv, Some("msg_b".into())),
            )
            .unwrap();
        store
            .create_message(
                MessageDraft::user("b")
                    .with_id("msg_b")
                    .into_message(&conv, Some("msg_a".into())),
            )
            .unwrap();

        assert!(matches!(graph.get_chain("msg_a"), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_chain_depth_is_bounded() {
        let (graph, conv) = graph_with_conversation();
        let graph = graph.with_max_chain_depth(3);
        for i in 0..4 {
            graph.create_message(&conv, MessageDraft::user(format!("{i}"))).unwrap();
        }
        assert!(matches!(
            graph.active_chain(&conv),
            Err(GraphError::ChainTooDeep(_))
        ));
    }

    #[test]
    fn test_missing_parent_ends_chain() {
        let (graph, conv) = graph_with_conversation();
        let orphan = graph
            .append_message(&conv, Some("msg_pruned"), MessageDraft::user("orphan"))
            .unwrap();
        let chain = graph.get_chain(&orphan.id).unwrap();
        assert_eq!(ids(&chain), vec![orphan.id.as_str()]);
    }

    #[test]
    fn test_concurrent_create_message_linearizes() {
        let (graph, conv) = graph_with_conversation();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let graph = graph.clone();
                let conv = conv.clone();
                std::thread::spawn(move || {
                    graph.create_message(&conv, MessageDraft::user(format!("{i}"))).unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let chain = graph.active_chain(&conv).unwrap();
        assert_eq!(chain.len(), 8);
        for message in &chain {
            assert!(graph.get_siblings(&message.id).unwrap().is_empty());
        }
    }

    #[test]
    fn test_stale_parent_append_forks() {
        let (graph, conv) = graph_with_conversation();
        let a = graph.create_message(&conv, MessageDraft::user("A")).unwrap();

        // Both writers read tip = A before either appended.
        let first = graph
            .append_message(&conv, Some(&a.id), MessageDraft::assistant("one"))
            .unwrap();
        let second = graph
            .append_message(&conv, Some(&a.id), MessageDraft::assistant("two"))
            .unwrap();

        assert_eq!(first.previous_id, second.previous_id);
        assert_eq!(second.branch_index, 1);
        assert_eq!(
            graph.get_conversation(&conv).unwrap().tip_message_id,
            Some(second.id)
        );
    }

    #[test]
    fn test_stale_parent_append_if_tip_conflicts() {
        let (graph, conv) = graph_with_conversation();
        let a = graph.create_message(&conv, MessageDraft::user("A")).unwrap();
        let first = graph
            .append_if_tip(&conv, Some(&a.id), MessageDraft::assistant("one"))
            .unwrap();

        let err = graph
            .append_if_tip(&conv, Some(&a.id), MessageDraft::assistant("two"))
            .unwrap_err();

        assert_eq!(
            err,
            GraphError::TipConflict {
                conversation_id: conv.clone(),
                expected: Some(a.id.clone()),
                actual: Some(first.id.clone()),
            }
        );
        assert!(graph.get_siblings(&first.id).unwrap().is_empty());
    }

    #[test]
    fn test_tool_use_two_step_lifecycle() {
        let (graph, conv) = graph_with_conversation();
        let pending = graph
            .create_tool_use(ToolUse::pending(None, "msg_x", &conv, "timer", Default::default()))
            .unwrap();
        assert_eq!(pending.status, ToolUseStatus::Pending);

        let failed = graph
            .complete_tool_use(&pending.id, false, None, Some("device offline".into()))
            .unwrap();
        assert_eq!(failed.status, ToolUseStatus::Error);
        assert!(failed.completed_at.is_some());
        assert_eq!(
            graph.tool_uses_for_message("msg_x").unwrap()[0].error.as_deref(),
            Some("device offline")
        );
    }

    #[test]
    fn test_rocks_backed_graph_branches() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let graph = MessageGraph::new(Arc::new(store));
        let conv = graph.create_conversation("durable").unwrap().id;

        let a = graph.create_message(&conv, MessageDraft::user("A")).unwrap();
        let b = graph.create_message(&conv, MessageDraft::assistant("B")).unwrap();
        let c = graph
            .append_message(&conv, Some(&a.id), MessageDraft::assistant("C"))
            .unwrap();

        assert_eq!(ids(&graph.get_siblings(&b.id).unwrap()), vec![c.id.as_str()]);
        graph.switch_branch(&conv, &b.id).unwrap();
        assert_eq!(
            ids(&graph.active_chain(&conv).unwrap()),
            vec![a.id.as_str(), b.id.as_str()]
        );
    }
}
