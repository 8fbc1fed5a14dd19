//! # alicia-hub: real-time router and conversation graph
//!
//! Multiplexes one binary protocol between conversation clients, a single
//! generation agent, a voice bridge, a device assistant and passive
//! monitors, and persists conversations as a branchable message graph.
//!
//! ## Architecture
//!
//! ```text
//!  client ──┐                          ┌──► agent    (exclusive slot)
//!  client ──┤   ┌────────────┐  ┌─────┐├──► voice    (exclusive slot)
//!  agent  ──┼──►│ Dispatcher │─►│ Hub │┼──► assistant(exclusive slot)
//!  voice  ──┤   └─────┬──────┘  └──┬──┘├──► clients  (per conversation)
//!  monitor──┘         │            │   └──► monitors (mirror of all traffic)
//!                     ▼            ▼
//!               ┌──────────┐  ┌─────────────┐
//!               │  Router  │─►│ SyncWaiters │◄── wait_for_generation
//!               └────┬─────┘  └─────────────┘
//!                    ▼
//!             ┌──────────────┐
//!             │ MessageGraph │── MemoryStore | RocksStore
//!             └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: envelope codec, message type tags and typed bodies
//! - [`graph`]: conversations, messages, tool uses and branch navigation
//! - [`hub`]: connection registry, fan-out and monitor mirroring
//! - [`sync`]: correlation of agent replies with blocked callers
//! - [`router`]: persistence and routing operations, the sync bridge
//! - [`dispatch`]: per-connection state machine and routing table
//! - [`server`]: WebSocket listener
//! - [`client`]: WebSocket client for workers and tooling

pub mod client;
pub mod dispatch;
pub mod graph;
pub mod hub;
pub mod protocol;
pub mod router;
pub mod server;
pub mod sync;

pub use client::HubClient;
pub use dispatch::{ConnectionState, Credentials, Dispatcher};
pub use graph::{
    Conversation, GraphError, GraphStore, MemoryStore, Message, MessageDraft, MessageGraph,
    RocksStore, StoreConfig, ToolUse,
};
pub use hub::{Hub, HubStats, Peer, PeerRole};
pub use protocol::{Envelope, MessageType, MonitorFrame, ProtocolError, TraceContext};
pub use router::{
    GenerationOptions, GenerationResult, RequestContext, RouteError, Router, SyncError,
};
pub use server::{HubServer, ServerConfig, ServerError, ServerStats};
pub use sync::SyncWaiters;
