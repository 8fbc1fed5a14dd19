//! Persisted graph entities.
//!
//! Messages reference their parent by id only (`previous_id`); the graph is
//! an id-keyed arena and never holds in-memory references between nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolUseStatus {
    Pending,
    Success,
    Error,
}

impl ToolUseStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ToolUseStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub status: ConversationStatus,
    /// Head of the active branch. `None` for an empty conversation.
    pub tip_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ids::conversation_id(),
            title: title.into(),
            status: ConversationStatus::Active,
            tip_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Parent pointer. `None` marks a chain root.
    pub previous_id: Option<String>,
    /// Position among siblings sharing `previous_id`, assigned by the store.
    pub branch_index: u32,
    pub role: Role,
    pub content: String,
    pub reasoning: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// Input for a message insert. The store decides `previous_id` and
/// `branch_index`.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    pub reasoning: Option<String>,
    pub status: MessageStatus,
}

impl MessageDraft {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            content: content.into(),
            reasoning: None,
            status: MessageStatus::Completed,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            ..Self::user(content)
        }
    }

    /// Keep a caller-supplied id instead of generating one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Materialize as a child of `previous_id` in `conversation_id`.
    pub fn into_message(self, conversation_id: &str, previous_id: Option<String>) -> Message {
        Message {
            id: self.id.unwrap_or_else(ids::message_id),
            conversation_id: conversation_id.to_string(),
            previous_id,
            branch_index: 0,
            role: self.role,
            content: self.content,
            reasoning: self.reasoning,
            status: self.status,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    /// Assistant message this tool use belongs to.
    pub message_id: String,
    pub conversation_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub execution: Option<String>,
    pub status: ToolUseStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolUse {
    pub fn pending(
        id: Option<String>,
        message_id: impl Into<String>,
        conversation_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(ids::tool_use_id),
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
            tool_name: tool_name.into(),
            arguments,
            execution: None,
            status: ToolUseStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_execution(mut self, execution: Option<String>) -> Self {
        self.execution = execution;
        self
    }
}
