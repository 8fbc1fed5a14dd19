//! Binary envelope protocol shared by every connection role.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬─────────────────┬──────────────────────────┬──────────────┐
//! │ type u16 │ conversation_id │ trace/span/flags/session │ body         │
//! │          │ string          │ /user (all optional)     │ JSON bytes   │
//! └──────────┴─────────────────┴──────────────────────────┴──────────────┘
//! ```
//!
//! The frame itself is bincode for minimal overhead. The body is a
//! self-describing JSON document kept as opaque bytes: the codec never
//! looks inside it, and callers decode it a second time with
//! [`Envelope::body`] once they know the type tag.

pub mod messages;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use messages::*;

/// Envelope type tags.
///
/// Numeric values are part of the wire contract. Tags this build does not
/// know decode as [`MessageType::Unknown`] instead of failing the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum MessageType {
    Error,
    UserMessage,
    AssistantMessage,
    ReasoningStep,
    ToolUseRequest,
    ToolUseResult,
    Ack,
    StartAnswer,
    MemoryTrace,
    AssistantSentence,
    GenerationRequest,
    ThinkingSummary,
    TitleUpdate,
    Subscribe,
    Unsubscribe,
    SubscribeAck,
    UnsubscribeAck,
    BranchUpdate,
    VoiceJoinRequest,
    VoiceJoinAck,
    VoiceLeaveRequest,
    VoiceLeaveAck,
    VoiceStatus,
    VoiceSpeaking,
    PreferencesUpdate,
    AssistantToolsRegister,
    AssistantToolsAck,
    AssistantHeartbeat,
    GenerationComplete,
    Unknown(u16),
}

impl MessageType {
    /// Numeric wire tag.
    pub fn tag(self) -> u16 {
        match self {
            Self::Error => 1,
            Self::UserMessage => 2,
            Self::AssistantMessage => 3,
            Self::ReasoningStep => 5,
            Self::ToolUseRequest => 6,
            Self::ToolUseResult => 7,
            Self::Ack => 8,
            Self::StartAnswer => 13,
            Self::MemoryTrace => 14,
            Self::AssistantSentence => 16,
            Self::GenerationRequest => 33,
            Self::ThinkingSummary => 34,
            Self::TitleUpdate => 35,
            Self::Subscribe => 40,
            Self::Unsubscribe => 41,
            Self::SubscribeAck => 42,
            Self::UnsubscribeAck => 43,
            Self::BranchUpdate => 50,
            Self::VoiceJoinRequest => 51,
            Self::VoiceJoinAck => 52,
            Self::VoiceLeaveRequest => 53,
            Self::VoiceLeaveAck => 54,
            Self::VoiceStatus => 55,
            Self::VoiceSpeaking => 56,
            Self::PreferencesUpdate => 60,
            Self::AssistantToolsRegister => 70,
            Self::AssistantToolsAck => 71,
            Self::AssistantHeartbeat => 72,
            Self::GenerationComplete => 80,
            Self::Unknown(tag) => tag,
        }
    }

    /// Human-readable name, used in logs and by the monitor printer.
    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::UserMessage => "UserMessage",
            Self::AssistantMessage => "AssistantMessage",
            Self::ReasoningStep => "ReasoningStep",
            Self::ToolUseRequest => "ToolUseRequest",
            Self::ToolUseResult => "ToolUseResult",
            Self::Ack => "Ack",
            Self::StartAnswer => "StartAnswer",
            Self::MemoryTrace => "MemoryTrace",
            Self::AssistantSentence => "AssistantSentence",
            Self::GenerationRequest => "GenerationRequest",
            Self::ThinkingSummary => "ThinkingSummary",
            Self::TitleUpdate => "TitleUpdate",
            Self::Subscribe => "Subscribe",
            Self::Unsubscribe => "Unsubscribe",
            Self::SubscribeAck => "SubscribeAck",
            Self::UnsubscribeAck => "UnsubscribeAck",
            Self::BranchUpdate => "BranchUpdate",
            Self::VoiceJoinRequest => "VoiceJoinRequest",
            Self::VoiceJoinAck => "VoiceJoinAck",
            Self::VoiceLeaveRequest => "VoiceLeaveRequest",
            Self::VoiceLeaveAck => "VoiceLeaveAck",
            Self::VoiceStatus => "VoiceStatus",
            Self::VoiceSpeaking => "VoiceSpeaking",
            Self::PreferencesUpdate => "PreferencesUpdate",
            Self::AssistantToolsRegister => "AssistantToolsRegister",
            Self::AssistantToolsAck => "AssistantToolsAck",
            Self::AssistantHeartbeat => "AssistantHeartbeat",
            Self::GenerationComplete => "GenerationComplete",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl From<u16> for MessageType {
    fn from(tag: u16) -> Self {
        match tag {
            1 => Self::Error,
            2 => Self::UserMessage,
            3 => Self::AssistantMessage,
            5 => Self::ReasoningStep,
            6 => Self::ToolUseRequest,
            7 => Self::ToolUseResult,
            8 => Self::Ack,
            13 => Self::StartAnswer,
            14 => Self::MemoryTrace,
            16 => Self::AssistantSentence,
            33 => Self::GenerationRequest,
            34 => Self::ThinkingSummary,
            35 => Self::TitleUpdate,
            40 => Self::Subscribe,
            41 => Self::Unsubscribe,
            42 => Self::SubscribeAck,
            43 => Self::UnsubscribeAck,
            50 => Self::BranchUpdate,
            51 => Self::VoiceJoinRequest,
            52 => Self::VoiceJoinAck,
            53 => Self::VoiceLeaveRequest,
            54 => Self::VoiceLeaveAck,
            55 => Self::VoiceStatus,
            56 => Self::VoiceSpeaking,
            60 => Self::PreferencesUpdate,
            70 => Self::AssistantToolsRegister,
            71 => Self::AssistantToolsAck,
            72 => Self::AssistantHeartbeat,
            80 => Self::GenerationComplete,
            other => Self::Unknown(other),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(msg_type: MessageType) -> Self {
        msg_type.tag()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.tag())
    }
}

/// W3C trace context plus session attribution carried on an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub trace_flags: u8,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: MessageType,
    /// Empty for frames that are not scoped to a conversation.
    pub conversation_id: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub trace_flags: Option<u8>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// JSON-encoded typed body, opaque to the codec.
    pub body: Vec<u8>,
}

impl Envelope {
    /// Build an envelope around a typed body.
    pub fn new<T: Serialize>(
        conversation_id: impl Into<String>,
        msg_type: MessageType,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let body = serde_json::to_vec(body)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::with_raw_body(conversation_id, msg_type, body))
    }

    /// Build an envelope from an already-encoded body.
    pub fn with_raw_body(
        conversation_id: impl Into<String>,
        msg_type: MessageType,
        body: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            conversation_id: conversation_id.into(),
            trace_id: None,
            span_id: None,
            trace_flags: None,
            session_id: None,
            user_id: None,
            body,
        }
    }

    /// Attach trace context fields.
    pub fn with_trace(mut self, trace: &TraceContext) -> Self {
        self.trace_id = Some(trace.trace_id.clone());
        self.span_id = Some(trace.span_id.clone());
        self.trace_flags = Some(trace.trace_flags);
        self.session_id = trace.session_id.clone();
        self.user_id = trace.user_id.clone();
        self
    }

    /// True when both trace and span ids are present and non-empty.
    pub fn has_trace_context(&self) -> bool {
        matches!(
            (&self.trace_id, &self.span_id),
            (Some(t), Some(s)) if !t.is_empty() && !s.is_empty()
        )
    }

    /// W3C `traceparent` header value: `00-{trace_id}-{span_id}-{flags}`.
    pub fn trace_parent(&self) -> Option<String> {
        if !self.has_trace_context() {
            return None;
        }
        Some(format!(
            "00-{}-{}-{:02x}",
            self.trace_id.as_deref().unwrap_or_default(),
            self.span_id.as_deref().unwrap_or_default(),
            self.trace_flags.unwrap_or(0)
        ))
    }

    /// Trace context of this envelope, if it carries one.
    pub fn trace_context(&self) -> Option<TraceContext> {
        if !self.has_trace_context() {
            return None;
        }
        Some(TraceContext {
            trace_id: self.trace_id.clone().unwrap_or_default(),
            span_id: self.span_id.clone().unwrap_or_default(),
            trace_flags: self.trace_flags.unwrap_or(0),
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
        })
    }

    /// Decode the body as `T`.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ProtocolError::Body(self.msg_type, e.to_string()))
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }
}

/// Mirror of a routed frame, sent to monitor connections.
///
/// `data` is the exact byte sequence that was routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorFrame {
    pub src: String,
    pub dst: String,
    pub data: Vec<u8>,
}

impl MonitorFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    /// Decode the mirrored payload as an envelope.
    pub fn envelope(&self) -> Result<Envelope, ProtocolError> {
        Envelope::decode(&self.data)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid {0} body: {1}")]
    Body(MessageType, String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let body = UserMessage {
            id: "msg_1".into(),
            conversation_id: "conv_1".into(),
            content: "hello".into(),
            previous_id: None,
        };
        let env = Envelope::new("conv_1", MessageType::UserMessage, &body).unwrap();
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();

        assert_eq!(decoded, env);
        let parsed: UserMessage = decoded.body().unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn test_envelope_roundtrip_with_trace() {
        let trace = TraceContext {
            trace_id: "0af7651916cd43dd8448eb211c80319c".into(),
            span_id: "b7ad6b7169203331".into(),
            trace_flags: 1,
            session_id: Some("conv_1".into()),
            user_id: Some("user_1".into()),
        };
        let env = Envelope::new("conv_1", MessageType::Ack, &Ack::default())
            .unwrap()
            .with_trace(&trace);
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();

        assert_eq!(decoded, env);
        assert!(decoded.has_trace_context());
        assert_eq!(decoded.trace_context(), Some(trace));
    }

    #[test]
    fn test_trace_parent_format() {
        let env = Envelope::with_raw_body("", MessageType::Ack, Vec::new()).with_trace(
            &TraceContext {
                trace_id: "abc".into(),
                span_id: "def".into(),
                trace_flags: 1,
                ..TraceContext::default()
            },
        );
        assert_eq!(env.trace_parent().as_deref(), Some("00-abc-def-01"));
    }

    #[test]
    fn test_no_trace_parent_without_span() {
        let mut env = Envelope::with_raw_body("", MessageType::Ack, Vec::new());
        env.trace_id = Some("abc".into());
        assert!(!env.has_trace_context());
        assert!(env.trace_parent().is_none());
    }

    #[test]
    fn test_unknown_tag_survives_decode() {
        let env = Envelope::with_raw_body("conv_1", MessageType::Unknown(999), b"{}".to_vec());
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Unknown(999));
        assert_eq!(decoded.msg_type.tag(), 999);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Error.tag(), 1);
        assert_eq!(MessageType::AssistantMessage.tag(), 3);
        assert_eq!(MessageType::ToolUseRequest.tag(), 6);
        assert_eq!(MessageType::GenerationRequest.tag(), 33);
        assert_eq!(MessageType::Subscribe.tag(), 40);
        assert_eq!(MessageType::BranchUpdate.tag(), 50);
        assert_eq!(MessageType::AssistantHeartbeat.tag(), 72);
        assert_eq!(MessageType::GenerationComplete.tag(), 80);
        for tag in 0..=100u16 {
            assert_eq!(MessageType::from(tag).tag(), tag);
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(Envelope::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_body_type_mismatch_is_error() {
        let env = Envelope::with_raw_body("c", MessageType::UserMessage, b"[1,2]".to_vec());
        let err = env.body::<UserMessage>().unwrap_err();
        assert!(matches!(err, ProtocolError::Body(MessageType::UserMessage, _)));
    }

    #[test]
    fn test_monitor_frame_carries_exact_bytes() {
        let env = Envelope::new("conv_1", MessageType::Ack, &Ack::default()).unwrap();
        let bytes = env.encode().unwrap();
        let frame = MonitorFrame {
            src: "agent".into(),
            dst: "server".into(),
            data: bytes.clone(),
        };
        let decoded = MonitorFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.data, bytes);
        assert_eq!(decoded.envelope().unwrap(), env);
    }
}
