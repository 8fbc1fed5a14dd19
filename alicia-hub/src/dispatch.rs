//! Per-connection state machine and routing table.
//!
//! ```text
//!                 Subscribe{agentMode}  ─► Agent
//!                 Subscribe{voiceMode}  ─► Voice
//!  Unclassified ─ Subscribe{monitorMode}─► Monitor      ──► read error ─► Closed
//!                 Subscribe{assistant}  ─► Assistant
//!                 Subscribe{conv}       ─► Client{convs}
//! ```
//!
//! Subscribe and Unsubscribe are handled inline because they change the
//! connection's state. Everything else is routed on a spawned task bounded
//! by the process timeout, so a client hanging up mid-request does not abort
//! persistence that is already underway.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::hub::{Hub, Peer, PeerRole};
use crate::protocol::{
    AssistantMessage, AssistantToolsAck, AssistantToolsRegister, Envelope, ErrorBody,
    MessageType, StartAnswer, Subscribe, SubscribeAck, ToolUseRequest, ToolUseResult,
    Unsubscribe, UnsubscribeAck, UserMessage,
};
use crate::router::{encode_frame, GenerationOptions, Router};

/// Secrets presented during the WebSocket handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub query_secret: Option<String>,
}

impl Credentials {
    pub fn new(bearer: Option<String>, query_secret: Option<String>) -> Self {
        Self {
            bearer,
            query_secret,
        }
    }

    /// With no configured secret every connection passes.
    pub fn authorizes(&self, secret: Option<&str>) -> bool {
        let Some(secret) = secret else {
            return true;
        };
        self.bearer.as_deref() == Some(secret) || self.query_secret.as_deref() == Some(secret)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unclassified,
    Client { conversations: HashSet<String> },
    Agent,
    Voice,
    Assistant,
    Monitor,
    Closed,
}

impl ConnectionState {
    pub fn role(&self) -> Option<PeerRole> {
        match self {
            ConnectionState::Client { .. } => Some(PeerRole::Client),
            ConnectionState::Agent => Some(PeerRole::Agent),
            ConnectionState::Voice => Some(PeerRole::Voice),
            ConnectionState::Assistant => Some(PeerRole::Assistant),
            ConnectionState::Monitor => Some(PeerRole::Monitor),
            ConnectionState::Unclassified | ConnectionState::Closed => None,
        }
    }

    fn for_role(role: PeerRole) -> Self {
        match role {
            PeerRole::Agent => ConnectionState::Agent,
            PeerRole::Voice => ConnectionState::Voice,
            PeerRole::Assistant => ConnectionState::Assistant,
            PeerRole::Monitor => ConnectionState::Monitor,
            PeerRole::Client | PeerRole::Server => ConnectionState::Client {
                conversations: HashSet::new(),
            },
        }
    }
}

/// One accepted socket as the dispatcher sees it.
#[derive(Debug)]
pub struct Connection {
    peer: Peer,
    credentials: Credentials,
    state: ConnectionState,
}

impl Connection {
    pub fn new(peer: Peer, credentials: Credentials) -> Self {
        Self {
            peer,
            credentials,
            state: ConnectionState::Unclassified,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Role used for routing and monitor tags. Unclassified sockets are
    /// treated as clients.
    fn origin_role(&self) -> PeerRole {
        self.state.role().unwrap_or(PeerRole::Client)
    }
}

#[derive(Clone)]
struct Origin {
    peer: Peer,
    role: PeerRole,
}

pub struct Dispatcher {
    router: Arc<Router>,
    agent_secret: Option<String>,
    process_timeout: Duration,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>, agent_secret: Option<String>, process_timeout: Duration) -> Self {
        Self {
            router,
            agent_secret,
            process_timeout,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    fn hub(&self) -> &Arc<Hub> {
        self.router.hub()
    }

    /// Handle one inbound binary frame.
    pub async fn handle_frame(self: &Arc<Self>, conn: &mut Connection, bytes: Vec<u8>) {
        if conn.state == ConnectionState::Closed {
            return;
        }

        let role = conn.origin_role();
        if role != PeerRole::Monitor {
            self.hub().mirror(role, PeerRole::Server, &bytes).await;
        }

        let envelope = match Envelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping malformed frame from {}: {e}", conn.peer.id());
                return;
            }
        };
        let raw = Arc::new(bytes);

        match envelope.msg_type {
            MessageType::Subscribe => self.handle_subscribe(conn, &envelope).await,
            MessageType::Unsubscribe => self.handle_unsubscribe(conn, &envelope).await,
            MessageType::Unknown(tag) => {
                log::debug!("Ignoring unknown message type {tag} from {role}");
            }
            msg_type => {
                let origin = Origin {
                    peer: conn.peer.clone(),
                    role,
                };
                let task = tokio::spawn(tokio::time::timeout(
                    self.process_timeout,
                    self.clone().route(origin, envelope, raw),
                ));
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => log::warn!("Processing {msg_type} from {role} timed out"),
                    Err(e) => log::error!("Processing {msg_type} from {role} failed: {e}"),
                }
            }
        }
    }

    /// Release whatever the connection holds.
    pub async fn close(&self, conn: &mut Connection) {
        let id = conn.peer.id();
        match &conn.state {
            ConnectionState::Client { .. } => {
                let removed = self.hub().unsubscribe_all(id).await;
                log::debug!("Client {id} left {removed} conversations");
            }
            ConnectionState::Agent => {
                self.hub().unsubscribe_agent(id).await;
            }
            ConnectionState::Voice => {
                self.hub().unsubscribe_voice(id).await;
            }
            ConnectionState::Assistant => {
                self.hub().unsubscribe_assistant(id).await;
            }
            ConnectionState::Monitor => {
                self.hub().unsubscribe_monitor(id).await;
            }
            ConnectionState::Unclassified | ConnectionState::Closed => {}
        }
        conn.state = ConnectionState::Closed;
    }

    // ─── Subscription ─────────────────────────────────────────────────

    async fn handle_subscribe(&self, conn: &mut Connection, envelope: &Envelope) {
        let subscribe: Subscribe = match envelope.body() {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Bad subscribe from {}: {e}", conn.peer.id());
                let nack = SubscribeAck {
                    error: Some(e.to_string()),
                    ..SubscribeAck::default()
                };
                self.send_subscribe_ack(conn, &envelope.conversation_id, nack).await;
                return;
            }
        };

        let mut ack = SubscribeAck {
            conversation_id: subscribe.conversation_id.clone(),
            agent_mode: subscribe.agent_mode,
            voice_mode: subscribe.voice_mode,
            monitor_mode: subscribe.monitor_mode,
            assistant_mode: subscribe.assistant_mode,
            ..SubscribeAck::default()
        };

        let requested = if subscribe.agent_mode {
            PeerRole::Agent
        } else if subscribe.voice_mode {
            PeerRole::Voice
        } else if subscribe.monitor_mode {
            PeerRole::Monitor
        } else if subscribe.assistant_mode {
            PeerRole::Assistant
        } else {
            PeerRole::Client
        };

        let result = match requested {
            PeerRole::Client => {
                let conversation_id = subscribe
                    .conversation_id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| envelope.conversation_id.clone());
                ack.conversation_id = Some(conversation_id.clone());
                self.subscribe_client(conn, conversation_id).await
            }
            role => self.claim_role(conn, role).await,
        };

        match result {
            Ok(()) => ack.success = true,
            Err(reason) => ack.error = Some(reason),
        }
        let conversation_id = ack.conversation_id.clone().unwrap_or_default();
        self.send_subscribe_ack(conn, &conversation_id, ack).await;
    }

    async fn subscribe_client(&self, conn: &mut Connection, conversation_id: String) -> Result<(), String> {
        if conversation_id.is_empty() {
            return Err("conversationId is required".to_string());
        }
        match &mut conn.state {
            ConnectionState::Unclassified => {
                conn.state = ConnectionState::Client {
                    conversations: HashSet::from([conversation_id.clone()]),
                };
            }
            ConnectionState::Client { conversations } => {
                conversations.insert(conversation_id.clone());
            }
            other => {
                return Err(format!(
                    "connection is already registered as {}",
                    other.role().map_or("closed", PeerRole::as_str)
                ));
            }
        }
        self.hub().subscribe(&conversation_id, conn.peer.clone()).await;
        log::info!("Client {} subscribed to {conversation_id}", conn.peer.id());
        Ok(())
    }

    async fn claim_role(&self, conn: &mut Connection, role: PeerRole) -> Result<(), String> {
        let privileged = matches!(role, PeerRole::Agent | PeerRole::Voice | PeerRole::Assistant);
        if privileged && !conn.credentials.authorizes(self.agent_secret.as_deref()) {
            log::warn!("Rejected {role} subscribe from {}: bad secret", conn.peer.id());
            return Err("unauthorized".to_string());
        }

        match conn.state.role() {
            None => {}
            Some(current) if current == role => {}
            Some(current) => {
                return Err(format!("connection is already registered as {current}"));
            }
        }

        let peer = conn.peer.clone();
        match role {
            PeerRole::Agent => self.hub().subscribe_agent(peer).await,
            PeerRole::Voice => self.hub().subscribe_voice(peer).await,
            PeerRole::Assistant => self.hub().subscribe_assistant(peer).await,
            PeerRole::Monitor => self.hub().subscribe_monitor(peer).await,
            PeerRole::Client | PeerRole::Server => {}
        }
        conn.state = ConnectionState::for_role(role);
        log::info!("Connection {} registered as {role}", conn.peer.id());
        Ok(())
    }

    async fn send_subscribe_ack(&self, conn: &Connection, conversation_id: &str, ack: SubscribeAck) {
        match encode_frame(conversation_id, MessageType::SubscribeAck, &ack, None) {
            Ok(frame) => {
                self.hub().reply(&conn.peer, frame).await;
            }
            Err(e) => log::error!("Failed to encode subscribe ack: {e}"),
        }
    }

    async fn handle_unsubscribe(&self, conn: &mut Connection, envelope: &Envelope) {
        let body: Unsubscribe = envelope.body().unwrap_or_default();
        let conversation_id = body
            .conversation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| envelope.conversation_id.clone());
        let id = conn.peer.id();

        let success = match &mut conn.state {
            ConnectionState::Client { conversations } => {
                conversations.remove(&conversation_id);
                self.hub().unsubscribe(&conversation_id, id).await
            }
            ConnectionState::Agent => self.hub().unsubscribe_agent(id).await,
            ConnectionState::Voice => self.hub().unsubscribe_voice(id).await,
            ConnectionState::Assistant => self.hub().unsubscribe_assistant(id).await,
            ConnectionState::Monitor => self.hub().unsubscribe_monitor(id).await,
            ConnectionState::Unclassified | ConnectionState::Closed => false,
        };
        if !matches!(conn.state, ConnectionState::Client { .. }) {
            conn.state = ConnectionState::Unclassified;
        }

        let ack = UnsubscribeAck {
            conversation_id: Some(conversation_id.clone()),
            success,
        };
        match encode_frame(&conversation_id, MessageType::UnsubscribeAck, &ack, None) {
            Ok(frame) => {
                self.hub().reply(&conn.peer, frame).await;
            }
            Err(e) => log::error!("Failed to encode unsubscribe ack: {e}"),
        }
    }

    // ─── Routing ──────────────────────────────────────────────────────

    async fn route(self: Arc<Self>, origin: Origin, envelope: Envelope, raw: Arc<Vec<u8>>) {
        let hub = self.hub();
        let conversation_id = envelope.conversation_id.as_str();

        match (origin.role, envelope.msg_type) {
            (_, MessageType::VoiceJoinRequest | MessageType::VoiceLeaveRequest) => {
                if conversation_id.is_empty() {
                    log::warn!("{} without a conversation id", envelope.msg_type);
                } else {
                    hub.send_to_voice(raw).await;
                }
            }
            (
                PeerRole::Voice,
                MessageType::VoiceJoinAck
                | MessageType::VoiceLeaveAck
                | MessageType::VoiceStatus
                | MessageType::VoiceSpeaking,
            ) => {
                self.broadcast(conversation_id, raw).await;
            }
            (_, MessageType::UserMessage) => self.route_user_message(&envelope).await,
            (PeerRole::Agent | PeerRole::Voice, MessageType::GenerationRequest) => {
                log::debug!("Ignoring generation request from {}", origin.role);
            }
            (PeerRole::Agent, _) => self.route_from_agent(&envelope, raw).await,
            (PeerRole::Assistant, MessageType::AssistantHeartbeat | MessageType::ToolUseResult) => {
                hub.record_assistant_heartbeat().await;
            }
            (PeerRole::Assistant, MessageType::AssistantToolsRegister) => {
                self.register_assistant_tools(&origin, &envelope).await;
            }
            (PeerRole::Monitor, MessageType::ToolUseRequest) => {
                if let Some(request) = decode::<ToolUseRequest>(&envelope) {
                    if request.is_client_execution() {
                        hub.send_to_assistant(raw).await;
                    }
                }
            }
            (_, MessageType::GenerationRequest) => {
                hub.send_to_agent(raw).await;
            }
            (role, msg_type) => {
                log::debug!("No route for {msg_type} from {role}");
            }
        }
    }

    async fn route_user_message(&self, envelope: &Envelope) {
        let Some(message) = decode::<UserMessage>(envelope) else {
            return;
        };
        let conversation_id = if message.conversation_id.is_empty() {
            envelope.conversation_id.as_str()
        } else {
            message.conversation_id.as_str()
        };
        let trace = envelope.trace_context();
        if let Err(e) = self
            .router
            .submit_user_message(
                conversation_id,
                &message.content,
                &GenerationOptions::default(),
                trace.as_ref(),
            )
            .await
        {
            log::error!("Failed to handle user message in {conversation_id}: {e}");
        }
    }

    async fn route_from_agent(&self, envelope: &Envelope, raw: Arc<Vec<u8>>) {
        match envelope.msg_type {
            MessageType::AssistantMessage => {
                let Some(message) = decode::<AssistantMessage>(envelope) else {
                    return;
                };
                self.router.accept_assistant_message(&message);
                let conversation_id = pick(&envelope.conversation_id, &message.conversation_id);
                self.broadcast(conversation_id, raw).await;
            }
            MessageType::ToolUseRequest => {
                let Some(request) = decode::<ToolUseRequest>(envelope) else {
                    return;
                };
                self.router.accept_tool_use_request(&request);
                let conversation_id = pick(&envelope.conversation_id, &request.conversation_id);
                self.broadcast(conversation_id, raw.clone()).await;
                if request.is_client_execution() {
                    self.hub().send_to_assistant(raw).await;
                }
            }
            MessageType::ToolUseResult => {
                let Some(result) = decode::<ToolUseResult>(envelope) else {
                    return;
                };
                self.router.accept_tool_use_result(&result);
                let conversation_id = pick(&envelope.conversation_id, &result.conversation_id);
                self.broadcast(conversation_id, raw).await;
            }
            MessageType::StartAnswer => {
                if let Some(start) = decode::<StartAnswer>(envelope) {
                    self.router.accept_start_answer(&start);
                }
                self.broadcast(&envelope.conversation_id, raw).await;
            }
            MessageType::Error => {
                if let Some(error) = decode::<ErrorBody>(envelope) {
                    self.router.accept_agent_error(&error);
                }
                self.broadcast(&envelope.conversation_id, raw).await;
            }
            _ => self.broadcast(&envelope.conversation_id, raw).await,
        }
    }

    async fn register_assistant_tools(&self, origin: &Origin, envelope: &Envelope) {
        let ack = match envelope.body::<AssistantToolsRegister>() {
            Ok(register) => {
                let tool_count = register.tools.len();
                self.hub().set_assistant_tools(register.tools).await;
                log::info!("Assistant registered {tool_count} tools");
                AssistantToolsAck {
                    success: true,
                    tool_count,
                    error: None,
                }
            }
            Err(e) => {
                log::warn!("Bad tool registration from assistant: {e}");
                AssistantToolsAck {
                    success: false,
                    tool_count: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        match encode_frame(&envelope.conversation_id, MessageType::AssistantToolsAck, &ack, None) {
            Ok(frame) => {
                self.hub().reply(&origin.peer, frame).await;
            }
            Err(e) => log::error!("Failed to encode tools ack: {e}"),
        }
    }

    async fn broadcast(&self, conversation_id: &str, raw: Arc<Vec<u8>>) {
        if conversation_id.is_empty() {
            return;
        }
        self.hub().broadcast_to_conversation(conversation_id, raw).await;
    }
}

fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Option<T> {
    match envelope.body() {
        Ok(body) => Some(body),
        Err(e) => {
            log::warn!("{e}");
            None
        }
    }
}

fn pick<'a>(envelope_conversation: &'a str, body_conversation: &'a str) -> &'a str {
    if envelope_conversation.is_empty() {
        body_conversation
    } else {
        envelope_conversation
    }
}
