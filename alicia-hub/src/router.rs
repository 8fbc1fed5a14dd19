//! Persistence and routing operations shared by the dispatcher and by
//! request/response callers.
//!
//! ```text
//!  REST handler ── wait_for_generation ──┐
//!                                        ▼
//!                        register waiter ─► GenerationRequest ─► agent
//!                                        │
//!  agent ─► AssistantMessage ─► accept_assistant_message
//!                                 ├── graph: append + advance tip
//!                                 └── waiters: resolve ──► caller returns
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::graph::{
    GraphError, GraphStore, MemoryStore, Message, MessageDraft, MessageGraph, RocksStore,
    StoreConfig, ToolUse,
};
use crate::hub::Hub;
use crate::protocol::{
    AssistantMessage, BranchUpdate, Envelope, ErrorBody, GenerationRequest, MessageType,
    ProtocolError, SiblingInfo, StartAnswer, ToolUseRequest, ToolUseResult, TraceContext,
    UserMessage,
};
use crate::server::ServerConfig;
use crate::sync::{Delivery, SyncWaiters, WaiterKey};

/// Knobs forwarded to the agent in a [`GenerationRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    /// `"send"`, `"regenerate"` or `"continue"`.
    pub request_type: String,
    pub enable_tools: bool,
    pub enable_reasoning: bool,
    pub use_pareto: bool,
    pub new_content: Option<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            request_type: "send".to_string(),
            enable_tools: true,
            enable_reasoning: true,
            use_pareto: false,
            new_content: None,
        }
    }
}

impl GenerationOptions {
    pub fn to_request(
        &self,
        conversation_id: &str,
        message_id: &str,
        previous_id: Option<&str>,
        streaming: bool,
    ) -> GenerationRequest {
        GenerationRequest {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            previous_id: previous_id.map(str::to_string),
            request_type: self.request_type.clone(),
            new_content: self.new_content.clone(),
            enable_tools: self.enable_tools,
            enable_reasoning: self.enable_reasoning,
            enable_streaming: streaming,
            use_pareto: self.use_pareto,
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }
}

/// Caller-side bounds for a synchronous wait.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
    pub trace: Option<TraceContext>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// Result of a synchronous generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub message_id: String,
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_uses: Vec<ToolUseRequest>,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Timed out waiting for the assistant reply")]
    Timeout,
    #[error("Request cancelled")]
    Cancelled,
    #[error("Failed to encode generation request: {0}")]
    Encode(#[from] ProtocolError),
    #[error("Failed to persist the user message: {0}")]
    Graph(#[from] GraphError),
    #[error("Waiter closed without an assistant message")]
    NoAssistantMessage,
    #[error("No agent connected")]
    AgentUnavailable,
    #[error("Agent error {code}: {message}")]
    Agent { code: i32, message: String },
}

impl From<RouteError> for SyncError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::Graph(e) => SyncError::Graph(e),
            RouteError::Protocol(e) => SyncError::Encode(e),
        }
    }
}

/// Encode a typed body into a shareable frame.
pub fn encode_frame<T: Serialize>(
    conversation_id: &str,
    msg_type: MessageType,
    body: &T,
    trace: Option<&TraceContext>,
) -> Result<Arc<Vec<u8>>, ProtocolError> {
    let mut envelope = Envelope::new(conversation_id, msg_type, body)?;
    if let Some(trace) = trace {
        envelope = envelope.with_trace(trace);
    }
    Ok(Arc::new(envelope.encode()?))
}

fn sibling_info(message: &Message) -> SiblingInfo {
    SiblingInfo {
        id: message.id.clone(),
        content: message.content.clone(),
        created_at: message.created_at.timestamp_millis(),
    }
}

pub struct Router {
    hub: Arc<Hub>,
    graph: MessageGraph,
    waiters: Arc<SyncWaiters>,
}

impl Router {
    pub fn new(hub: Arc<Hub>, graph: MessageGraph) -> Self {
        Self {
            hub,
            graph,
            waiters: Arc::new(SyncWaiters::new()),
        }
    }

    /// Build a hub and open the configured store (RocksDB when a storage
    /// path is set, memory otherwise).
    pub fn from_config(config: &ServerConfig) -> Result<Self, GraphError> {
        let store: Arc<dyn GraphStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::new(path))?),
            None => Arc::new(MemoryStore::new()),
        };
        let graph = MessageGraph::new(store).with_max_chain_depth(config.max_chain_depth);
        Ok(Self::new(Arc::new(Hub::new(config.write_timeout)), graph))
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn graph(&self) -> &MessageGraph {
        &self.graph
    }

    pub fn waiters(&self) -> &Arc<SyncWaiters> {
        &self.waiters
    }

    /// Send a generation request to the agent. `Ok(false)` when no agent
    /// holds the slot.
    pub async fn send_generation_request(
        &self,
        request: &GenerationRequest,
        trace: Option<&TraceContext>,
    ) -> Result<bool, ProtocolError> {
        let frame = encode_frame(
            &request.conversation_id,
            MessageType::GenerationRequest,
            request,
            trace,
        )?;
        let sent = self.hub.send_to_agent(frame).await;
        if sent {
            log::debug!(
                "Generation request for {} in {} sent to agent",
                request.message_id,
                request.conversation_id
            );
        }
        Ok(sent)
    }

    /// Append a user message at the tip, show it to the conversation and ask
    /// the agent for a streamed answer. Blank content is ignored.
    pub async fn submit_user_message(
        &self,
        conversation_id: &str,
        content: &str,
        options: &GenerationOptions,
        trace: Option<&TraceContext>,
    ) -> Result<Option<Message>, RouteError> {
        if content.trim().is_empty() {
            return Ok(None);
        }

        let message = self
            .graph
            .create_message(conversation_id, MessageDraft::user(content))?;

        let echo = UserMessage {
            id: message.id.clone(),
            conversation_id: conversation_id.to_string(),
            content: message.content.clone(),
            previous_id: message.previous_id.clone(),
        };
        let frame = encode_frame(conversation_id, MessageType::UserMessage, &echo, trace)?;
        self.hub.broadcast_to_conversation(conversation_id, frame).await;

        let request = options.to_request(
            conversation_id,
            &message.id,
            message.previous_id.as_deref(),
            true,
        );
        if !self.send_generation_request(&request, trace).await? {
            log::warn!("User message {} stored but no agent is connected", message.id);
        }
        Ok(Some(message))
    }

    /// Issue a generation request for `user_message_id` and wait for the
    /// correlated assistant message.
    ///
    /// The waiter is registered before the request goes out and is removed
    /// on every exit path.
    pub async fn wait_for_generation(
        &self,
        conversation_id: &str,
        user_message_id: &str,
        previous_id: Option<&str>,
        options: &GenerationOptions,
        ctx: &RequestContext,
    ) -> Result<GenerationResult, SyncError> {
        let mut guard = self
            .waiters
            .register(WaiterKey::new(conversation_id, user_message_id));

        let request = options.to_request(conversation_id, user_message_id, previous_id, false);
        if !self.send_generation_request(&request, ctx.trace.as_ref()).await? {
            return Err(SyncError::AgentUnavailable);
        }

        let deadline = async {
            match ctx.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            delivery = guard.recv() => match delivery {
                Some(Delivery::Completed { message, tool_uses }) => Ok(GenerationResult {
                    message_id: message.id,
                    content: message.content,
                    reasoning: message.reasoning,
                    tool_uses,
                }),
                Some(Delivery::Failed(error)) => Err(SyncError::Agent {
                    code: error.code,
                    message: error.message,
                }),
                None => Err(SyncError::NoAssistantMessage),
            },
            _ = ctx.cancel.cancelled() => {
                log::debug!("Wait for {user_message_id} cancelled by caller");
                Err(SyncError::Cancelled)
            }
            _ = deadline => {
                log::warn!("Wait for {user_message_id} in {conversation_id} timed out");
                Err(SyncError::Timeout)
            }
        }
    }

    /// Store a user message and wait for the answer to it.
    pub async fn send_and_wait(
        &self,
        conversation_id: &str,
        content: &str,
        options: &GenerationOptions,
        ctx: &RequestContext,
    ) -> Result<GenerationResult, SyncError> {
        let message = self
            .graph
            .create_message(conversation_id, MessageDraft::user(content))?;
        self.wait_for_generation(
            conversation_id,
            &message.id,
            message.previous_id.as_deref(),
            options,
            ctx,
        )
        .await
    }

    // ─── Agent traffic ────────────────────────────────────────────────

    /// Persist an agent answer under the id and parent it chose, advance the
    /// tip and wake its waiter. Persistence failures are logged only.
    pub fn accept_assistant_message(&self, message: &AssistantMessage) -> Option<Message> {
        let mut draft = MessageDraft::assistant(message.content.as_str()).with_id(message.id.as_str());
        if let Some(reasoning) = &message.reasoning {
            draft = draft.with_reasoning(reasoning.as_str());
        }

        let stored = match self.graph.append_message(
            &message.conversation_id,
            message.previous_id.as_deref(),
            draft,
        ) {
            Ok(stored) => Some(stored),
            Err(e) => {
                log::error!("Failed to persist assistant message {}: {e}", message.id);
                None
            }
        };

        self.waiters.resolve(message);
        stored
    }

    pub fn accept_start_answer(&self, start: &StartAnswer) -> bool {
        self.waiters.bind_answer(
            &start.conversation_id,
            &start.message_id,
            start.previous_id.as_deref(),
        )
    }

    /// Record a pending tool use and buffer it for a waiting caller.
    pub fn accept_tool_use_request(&self, request: &ToolUseRequest) -> Option<ToolUse> {
        let tool_use = ToolUse::pending(
            Some(request.id.clone()),
            request.message_id.as_str(),
            request.conversation_id.as_str(),
            request.tool_name.as_str(),
            request.arguments.clone(),
        )
        .with_execution(request.execution.clone());

        let stored = match self.graph.create_tool_use(tool_use) {
            Ok(stored) => Some(stored),
            Err(e) => {
                log::error!("Failed to persist tool use {}: {e}", request.id);
                None
            }
        };

        self.waiters.record_tool_use(request);
        stored
    }

    pub fn accept_tool_use_result(&self, result: &ToolUseResult) -> Option<ToolUse> {
        let id = if result.request_id.is_empty() {
            &result.id
        } else {
            &result.request_id
        };
        match self
            .graph
            .complete_tool_use(id, result.success, result.result.clone(), result.error.clone())
        {
            Ok(tool_use) => Some(tool_use),
            Err(e) => {
                log::error!("Failed to complete tool use {id}: {e}");
                None
            }
        }
    }

    pub fn accept_agent_error(&self, error: &ErrorBody) -> bool {
        self.waiters.fail(error)
    }

    // ─── Branches ─────────────────────────────────────────────────────

    /// Move the tip and tell subscribers which sibling is now active.
    pub async fn switch_branch(
        &self,
        conversation_id: &str,
        target_message_id: &str,
    ) -> Result<BranchUpdate, RouteError> {
        self.graph.switch_branch(conversation_id, target_message_id)?;

        let target = self.graph.get_message(target_message_id)?;
        let siblings = self.graph.sibling_group(target_message_id)?;
        let update = BranchUpdate {
            conversation_id: conversation_id.to_string(),
            parent_message_id: target.previous_id.clone(),
            new_sibling: sibling_info(&target),
            all_siblings: siblings.iter().map(sibling_info).collect(),
            total_count: siblings.len(),
        };

        let frame = encode_frame(conversation_id, MessageType::BranchUpdate, &update, None)?;
        self.hub.broadcast_to_conversation(conversation_id, frame).await;
        Ok(update)
    }
}
