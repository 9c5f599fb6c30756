use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, RoomId, UserId};

// -- History --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub sender_id: UserId,
    pub message_text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<HistorySender>,
}

/// The history API has returned both a bare display name and a populated
/// profile object for `sender`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistorySender {
    Name(String),
    Profile {
        #[serde(default, alias = "username")]
        name: Option<String>,
    },
}

impl HistorySender {
    pub fn display_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            Self::Profile { name } => name.as_deref(),
        }
    }
}

impl HistoryEntry {
    pub fn into_message(self, room_id: &RoomId) -> ChatMessage {
        let sender_display_name = self
            .sender
            .as_ref()
            .and_then(HistorySender::display_name)
            .map(str::to_string);
        ChatMessage {
            room_id: room_id.clone(),
            sender_id: self.sender_id,
            body: self.message_text,
            sent_at: self.created_at,
            sender_display_name,
            id: self.id,
        }
    }
}

// -- Initiation --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateChatRequest {
    pub pet_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateChatResponse {
    pub chat_id: RoomId,
}

// -- Chat list --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: RoomId,
    #[serde(default)]
    pub other_participant: Option<Participant>,
    #[serde(default)]
    pub pet_name: Option<String>,
    #[serde(default)]
    pub pet_image: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default, alias = "_id")]
    pub id: Option<UserId>,
    #[serde(default)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_accepts_both_sender_shapes() {
        let raw = r#"{
            "messages": [
                { "senderId": "a", "messageText": "hello", "createdAt": "2024-05-01T10:00:00Z", "sender": "Ana" },
                { "senderId": "b", "messageText": "hey", "createdAt": "2024-05-01T10:01:00Z", "sender": { "name": "Bo", "email": "bo@example.com" } },
                { "senderId": "c", "messageText": "yo", "createdAt": "2024-05-01T10:02:00Z" }
            ]
        }"#;
        let resp: HistoryResponse = serde_json::from_str(raw).unwrap();
        let room = RoomId::from("42");
        let msgs: Vec<ChatMessage> = resp
            .messages
            .into_iter()
            .map(|e| e.into_message(&room))
            .collect();

        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].sender_display_name.as_deref(), Some("Ana"));
        assert_eq!(msgs[1].sender_display_name.as_deref(), Some("Bo"));
        assert_eq!(msgs[2].sender_display_name, None);
        assert!(msgs.iter().all(|m| m.room_id == room));
    }

    #[test]
    fn empty_history_body_is_valid() {
        let resp: HistoryResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.messages.is_empty());
    }

    #[test]
    fn chat_summary_tolerates_missing_optionals() {
        let raw = r#"[{ "id": "r1", "petName": "Rex", "updatedAt": "2024-05-01T10:00:00Z" }]"#;
        let list: Vec<ChatSummary> = serde_json::from_str(raw).unwrap();
        assert_eq!(list[0].id.as_str(), "r1");
        assert!(list[0].other_participant.is_none());
        assert!(list[0].last_message.is_none());
    }
}
