use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, RoomId, TypingKind, TypingSignal, UserId};

/// Chat message payload as carried by `send_message` / `receive_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Only some gateways stamp a stable id on relayed messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub room_id: RoomId,
    pub sender_id: UserId,
}

/// Commands sent FROM client TO gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Join a room. Membership lives in the gateway session, so this has to be
    /// re-sent after every reconnect.
    JoinChat(RoomId),

    /// Publish a message to a room
    SendMessage(WireMessage),

    /// Local user started composing
    Typing(TypingPayload),

    /// Local user stopped composing
    StopTyping(TypingPayload),
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinChat(_) => "join_chat",
            Self::SendMessage(_) => "send_message",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop_typing",
        }
    }

    pub fn typing(signal: &TypingSignal) -> Self {
        let payload = TypingPayload {
            room_id: signal.room_id.clone(),
            sender_id: signal.sender_id.clone(),
        };
        match signal.kind {
            TypingKind::Typing => Self::Typing(payload),
            TypingKind::StopTyping => Self::StopTyping(payload),
        }
    }
}

/// Events sent FROM gateway TO client. All of them are room-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message posted to a joined room, echoed to the sender as well
    ReceiveMessage(WireMessage),

    /// Another participant started typing
    Typing(TypingPayload),

    /// Another participant stopped typing
    StopTyping(TypingPayload),
}

impl ServerEvent {
    /// Returns the room this event belongs to.
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::ReceiveMessage(msg) => &msg.room_id,
            Self::Typing(p) | Self::StopTyping(p) => &p.room_id,
        }
    }

    pub fn typing_signal(&self) -> Option<TypingSignal> {
        let (payload, kind) = match self {
            Self::Typing(p) => (p, TypingKind::Typing),
            Self::StopTyping(p) => (p, TypingKind::StopTyping),
            Self::ReceiveMessage(_) => return None,
        };
        Some(TypingSignal {
            room_id: payload.room_id.clone(),
            sender_id: payload.sender_id.clone(),
            kind,
        })
    }
}

impl From<WireMessage> for ChatMessage {
    fn from(msg: WireMessage) -> Self {
        Self {
            room_id: msg.room_id,
            sender_id: msg.sender_id,
            body: msg.message,
            sent_at: msg.timestamp,
            sender_display_name: msg.sender_name,
            id: msg.id,
        }
    }
}
