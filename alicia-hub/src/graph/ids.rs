//! Prefixed entity ids: `conv_`, `msg_` and `tu_` followed by a 21-char nanoid.

const ID_LEN: usize = 21;

pub const CONVERSATION_PREFIX: &str = "conv";
pub const MESSAGE_PREFIX: &str = "msg";
pub const TOOL_USE_PREFIX: &str = "tu";

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", nanoid::nanoid!(ID_LEN))
}

pub fn conversation_id() -> String {
    new_id(CONVERSATION_PREFIX)
}

pub fn message_id() -> String {
    new_id(MESSAGE_PREFIX)
}

pub fn tool_use_id() -> String {
    new_id(TOOL_USE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_length() {
        let id = message_id();
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), "msg_".len() + ID_LEN);
        assert_ne!(message_id(), message_id());
        assert!(conversation_id().starts_with("conv_"));
        assert!(tool_use_id().starts_with("tu_"));
    }
}
