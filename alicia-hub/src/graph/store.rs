//! Persistence contract consumed by [`MessageGraph`](super::MessageGraph)
//! and the router.

use super::GraphError;
use super::model::{Conversation, Message, ToolUse};

/// Operations available inside [`GraphStore::with_tx`].
///
/// Everything done through one `GraphTx` commits together or not at all.
pub trait GraphTx {
    fn get_conversation(&self, id: &str) -> Result<Conversation, GraphError>;

    /// Insert `message`, or update content/reasoning/status if its id
    /// already exists. The store assigns `branch_index` on insert.
    fn create_message(&mut self, message: Message) -> Result<Message, GraphError>;

    fn update_conversation_tip(
        &mut self,
        conversation_id: &str,
        tip: Option<&str>,
    ) -> Result<(), GraphError>;
}

/// Storage backend for conversations, messages and tool uses.
///
/// Implementations must be safe to share between connection tasks.
pub trait GraphStore: Send + Sync {
    fn create_conversation(&self, conversation: Conversation) -> Result<Conversation, GraphError>;

    fn get_conversation(&self, id: &str) -> Result<Conversation, GraphError>;

    /// Same semantics as [`GraphTx::create_message`], committed on its own.
    fn create_message(&self, message: Message) -> Result<Message, GraphError>;

    fn get_message(&self, id: &str) -> Result<Message, GraphError>;

    /// Retarget the tip. Does not validate the target.
    fn update_conversation_tip(
        &self,
        conversation_id: &str,
        tip: Option<&str>,
    ) -> Result<(), GraphError>;

    /// All messages sharing `message_id`'s parent, itself included, ordered
    /// by `branch_index`.
    fn get_message_siblings(&self, message_id: &str) -> Result<Vec<Message>, GraphError>;

    /// Every message of a conversation across all branches, oldest first.
    fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, GraphError>;

    fn create_tool_use(&self, tool_use: ToolUse) -> Result<ToolUse, GraphError>;

    fn update_tool_use(&self, tool_use: &ToolUse) -> Result<(), GraphError>;

    fn get_tool_use(&self, id: &str) -> Result<ToolUse, GraphError>;

    fn tool_uses_for_message(&self, message_id: &str) -> Result<Vec<ToolUse>, GraphError>;

    /// Run `f` atomically. An `Err` from `f` discards every write it made.
    fn with_tx(
        &self,
        f: &mut dyn FnMut(&mut dyn GraphTx) -> Result<(), GraphError>,
    ) -> Result<(), GraphError>;
}

/// Next free `branch_index` for a new child among `siblings`.
pub(crate) fn next_branch_index<'a>(siblings: impl Iterator<Item = &'a Message>) -> u32 {
    siblings
        .map(|m| m.branch_index + 1)
        .max()
        .unwrap_or(0)
}
