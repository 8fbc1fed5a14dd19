//! Branch-aware message graph.
//!
//! ```text
//!                 ┌─ B (branch 0)
//! root ── A ──────┤
//!                 └─ C (branch 1) ◄── tip
//! ```
//!
//! Every message points at its parent through `previous_id`. Messages that
//! share a parent are siblings; the conversation's tip selects which chain
//! is the active one. Switching branches only moves the tip, nothing is
//! ever deleted.

pub mod ids;
pub mod memory;
pub mod model;
pub mod rocks;
pub mod service;
pub mod store;

use thiserror::Error;

pub use memory::MemoryStore;
pub use model::{
    Conversation, ConversationStatus, Message, MessageDraft, MessageStatus, Role, ToolUse,
    ToolUseStatus,
};
pub use rocks::{RocksStore, StoreConfig};
pub use service::{MessageGraph, DEFAULT_MAX_CHAIN_DEPTH};
pub use store::{GraphStore, GraphTx};

/// Graph and storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Tip of {conversation_id} moved: expected {expected:?}, found {actual:?}")]
    TipConflict {
        conversation_id: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    #[error("Chain from {0} exceeds the maximum depth")]
    ChainTooDeep(String),
    #[error("Cycle in message chain at {0}")]
    Cycle(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}
