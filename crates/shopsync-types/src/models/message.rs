use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a support/chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Customer,
    Agent,
    System,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Customer => "customer",
            SenderRole::Agent => "agent",
            SenderRole::System => "system",
        }
    }
}

/// A message in a support ticket or chat conversation.
///
/// Optimistic records are created locally and have no `server_id` yet.
/// Authoritative records come from the backend and carry one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub content: String,
    pub sender: SenderRole,
    #[serde(default)]
    pub sender_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Idempotency token minted by the client for locally sent messages and
    /// echoed back by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

impl MessageRecord {
    pub fn is_authoritative(&self) -> bool {
        self.server_id.is_some()
    }

    pub fn is_optimistic(&self) -> bool {
        self.server_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_echoed_message() {
        let json = r#"{
            "content": "Where is my parcel?",
            "sender": "customer",
            "senderName": "Dana",
            "createdAt": "2026-03-01T12:00:01Z",
            "serverId": "m-77",
            "clientToken": "tok-1"
        }"#;

        let record: MessageRecord = serde_json::from_str(json).unwrap();
        assert!(record.is_authoritative());
        assert_eq!(record.sender, SenderRole::Customer);
        assert_eq!(record.client_token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn test_legacy_message_without_token() {
        let json = r#"{
            "content": "hello",
            "sender": "agent",
            "createdAt": "2026-03-01T12:00:01Z"
        }"#;

        let record: MessageRecord = serde_json::from_str(json).unwrap();
        assert!(record.is_optimistic());
        assert!(record.client_token.is_none());
        assert_eq!(record.sender_name, "");
    }
}
