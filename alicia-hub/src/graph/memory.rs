//! In-process graph store: id-keyed maps plus a children index.
//!
//! ```text
//! messages:  msg_id ──► Message { previous_id, .. }
//! children:  (conv_id, previous_id) ──► [child ids, insertion order]
//! ```
//!
//! Transactions hold the write lock for their whole duration and keep an
//! undo log, replayed in reverse when the closure fails.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::GraphError;
use super::model::{Conversation, Message, ToolUse};
use super::store::{next_branch_index, GraphStore, GraphTx};

type ChildrenKey = (String, Option<String>);

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Message>,
    children: HashMap<ChildrenKey, Vec<String>>,
    tool_uses: HashMap<String, ToolUse>,
    tool_uses_by_message: HashMap<String, Vec<String>>,
}

enum Undo {
    RemoveMessage(Message),
    RestoreMessage(Message),
    RestoreTip {
        conversation_id: String,
        tip: Option<String>,
        updated_at: DateTime<Utc>,
    },
}

impl MemoryState {
    fn conversation(&self, id: &str) -> Result<&Conversation, GraphError> {
        self.conversations
            .get(id)
            .ok_or_else(|| GraphError::NotFound(format!("conversation {id}")))
    }

    fn upsert_message(&mut self, mut message: Message) -> Result<(Message, Undo), GraphError> {
        if let Some(existing) = self.messages.get_mut(&message.id) {
            let before = existing.clone();
            existing.content = message.content;
            existing.reasoning = message.reasoning;
            existing.status = message.status;
            return Ok((existing.clone(), Undo::RestoreMessage(before)));
        }

        self.conversation(&message.conversation_id)?;

        let key = (message.conversation_id.clone(), message.previous_id.clone());
        let siblings = self.children.entry(key).or_default();
        message.branch_index =
            next_branch_index(siblings.iter().filter_map(|id| self.messages.get(id)));
        siblings.push(message.id.clone());
        self.messages.insert(message.id.clone(), message.clone());

        Ok((message.clone(), Undo::RemoveMessage(message)))
    }

    fn set_tip(&mut self, conversation_id: &str, tip: Option<&str>) -> Result<Undo, GraphError> {
        let conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| GraphError::NotFound(format!("conversation {conversation_id}")))?;
        let undo = Undo::RestoreTip {
            conversation_id: conversation_id.to_string(),
            tip: conversation.tip_message_id.clone(),
            updated_at: conversation.updated_at,
        };
        conversation.tip_message_id = tip.map(str::to_string);
        conversation.updated_at = Utc::now();
        Ok(undo)
    }

    fn rollback(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::RemoveMessage(message) => {
                    self.messages.remove(&message.id);
                    let key = (message.conversation_id, message.previous_id);
                    if let Some(siblings) = self.children.get_mut(&key) {
                        siblings.retain(|id| id != &message.id);
                        if siblings.is_empty() {
                            self.children.remove(&key);
                        }
                    }
                }
                Undo::RestoreMessage(message) => {
                    self.messages.insert(message.id.clone(), message);
                }
                Undo::RestoreTip {
                    conversation_id,
                    tip,
                    updated_at,
                } => {
                    if let Some(conversation) = self.conversations.get_mut(&conversation_id) {
                        conversation.tip_message_id = tip;
                        conversation.updated_at = updated_at;
                    }
                }
            }
        }
    }
}

struct MemoryTx<'a> {
    state: &'a mut MemoryState,
    undo: Vec<Undo>,
}

impl GraphTx for MemoryTx<'_> {
    fn get_conversation(&self, id: &str) -> Result<Conversation, GraphError> {
        self.state.conversation(id).cloned()
    }

    fn create_message(&mut self, message: Message) -> Result<Message, GraphError> {
        let (message, undo) = self.state.upsert_message(message)?;
        self.undo.push(undo);
        Ok(message)
    }

    fn update_conversation_tip(
        &mut self,
        conversation_id: &str,
        tip: Option<&str>,
    ) -> Result<(), GraphError> {
        let undo = self.state.set_tip(conversation_id, tip)?;
        self.undo.push(undo);
        Ok(())
    }
}

/// Graph store kept entirely in memory. Used when no data directory is
/// configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, GraphError> {
        self.state
            .read()
            .map_err(|_| GraphError::Database("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, GraphError> {
        self.state
            .write()
            .map_err(|_| GraphError::Database("memory store lock poisoned".into()))
    }
}

impl GraphStore for MemoryStore {
    fn create_conversation(&self, conversation: Conversation) -> Result<Conversation, GraphError> {
        let mut state = self.write()?;
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    fn get_conversation(&self, id: &str) -> Result<Conversation, GraphError> {
        self.read()?.conversation(id).cloned()
    }

    fn create_message(&self, message: Message) -> Result<Message, GraphError> {
        let (message, _) = self.write()?.upsert_message(message)?;
        Ok(message)
    }

    fn get_message(&self, id: &str) -> Result<Message, GraphError> {
        self.read()?
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| GraphError::NotFound(format!("message {id}")))
    }

    fn update_conversation_tip(
        &self,
        conversation_id: &str,
        tip: Option<&str>,
    ) -> Result<(), GraphError> {
        self.write()?.set_tip(conversation_id, tip)?;
        Ok(())
    }

    fn get_message_siblings(&self, message_id: &str) -> Result<Vec<Message>, GraphError> {
        let state = self.read()?;
        let message = state
            .messages
            .get(message_id)
            .ok_or_else(|| GraphError::NotFound(format!("message {message_id}")))?;
        let key = (message.conversation_id.clone(), message.previous_id.clone());

        let mut siblings: Vec<Message> = state
            .children
            .get(&key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        siblings.sort_by_key(|m| m.branch_index);
        Ok(siblings)
    }

    fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, GraphError> {
        let state = self.read()?;
        let mut messages: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.branch_index.cmp(&b.branch_index))
        });
        Ok(messages)
    }

    fn create_tool_use(&self, tool_use: ToolUse) -> Result<ToolUse, GraphError> {
        let mut state = self.write()?;
        if !state.tool_uses.contains_key(&tool_use.id) {
            state
                .tool_uses_by_message
                .entry(tool_use.message_id.clone())
                .or_default()
                .push(tool_use.id.clone());
        }
        state.tool_uses.insert(tool_use.id.clone(), tool_use.clone());
        Ok(tool_use)
    }

    fn update_tool_use(&self, tool_use: &ToolUse) -> Result<(), GraphError> {
        let mut state = self.write()?;
        let slot = state
            .tool_uses
            .get_mut(&tool_use.id)
            .ok_or_else(|| GraphError::NotFound(format!("tool use {}", tool_use.id)))?;
        *slot = tool_use.clone();
        Ok(())
    }

    fn get_tool_use(&self, id: &str) -> Result<ToolUse, GraphError> {
        self.read()?
            .tool_uses
            .get(id)
            .cloned()
            .ok_or_else(|| GraphError::NotFound(format!("tool use {id}")))
    }

    fn tool_uses_for_message(&self, message_id: &str) -> Result<Vec<ToolUse>, GraphError> {
        let state = self.read()?;
        Ok(state
            .tool_uses_by_message
            .get(message_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.tool_uses.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn with_tx(
        &self,
        f: &mut dyn FnMut(&mut dyn GraphTx) -> Result<(), GraphError>,
    ) -> Result<(), GraphError> {
        let mut state = self.write()?;
        let mut tx = MemoryTx {
            state: &mut *state,
            undo: Vec::new(),
        };
        match f(&mut tx) {
            Ok(()) => Ok(()),
            Err(e) => {
                let undo = std::mem::take(&mut tx.undo);
                tx.state.rollback(undo);
                Err(e)
            }
        }
    }
}
