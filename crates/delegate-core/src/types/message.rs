//! Message model — chat/event/command rows with the delivery lifecycle.

use serde::{Deserialize, Serialize};

/// Message type stored in the `messages` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Routed agent/human chat, drives turn dispatch.
    Chat,
    /// Append-only audit events (merge started, status changes, ...).
    Event,
    /// Magic commands with a JSON `result`.
    Command,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Event => "event",
            Self::Command => "command",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "event" => Some(Self::Event),
            "command" => Some(Self::Command),
            _ => None,
        }
    }
}

/// A row in the `messages` table.
///
/// Chat lifecycle: `timestamp` (created) -> `delivered_at` (routed,
/// set on send) -> `seen_at` (picked up by the dispatcher) ->
/// `processed_at` (the turn consuming it completed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub timestamp: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub msg_type: MessageType,
    pub task_id: Option<i64>,
    pub delivered_at: Option<String>,
    pub seen_at: Option<String>,
    pub processed_at: Option<String>,
    /// Command output as JSON, for `command` rows.
    pub result: Option<String>,
    pub team: String,
    pub team_uuid: String,
    pub sender_uuid: String,
    pub recipient_uuid: String,
}

impl Message {
    pub fn is_unread(&self) -> bool {
        self.processed_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_roundtrip() {
        for s in ["chat", "event", "command"] {
            assert_eq!(MessageType::parse(s).unwrap().as_str(), s);
        }
        assert_eq!(MessageType::parse("note"), None);
    }
}
