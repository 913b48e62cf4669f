use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ClientNonce, MessageId, MessageKind, RoomId, RoomKind, UserId, UserRole},
    error::ApiError,
};

/// Message content, resolved once at the API boundary. Downstream code
/// matches on this enum instead of re-guessing field shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    File {
        url: String,
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
    },
    System {
        text: String,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::File { .. } => MessageKind::File,
            Self::System { .. } => MessageKind::System,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<ClientNonce>,
    #[serde(default)]
    pub read_by: Vec<UserId>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub kind: RoomKind,
    pub creator_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<String>,
    pub participant_ids: Vec<UserId>,
    pub participant_count: u32,
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUserRequest {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    pub role: UserRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePrivateRoomRequest {
    pub user_id: UserId,
    pub participant_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<ClientNonce>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddParticipantsRequest {
    pub user_id: UserId,
    pub participant_ids: Vec<UserId>,
}

/// Frames a client may send over its websocket connection. Subscriptions are
/// per room; `room_updated` events arrive on the user channel without one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    SubscribeRoom { room_id: RoomId },
    UnsubscribeRoom { room_id: RoomId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: MessagePayload,
    },
    MessageStatusUpdated {
        room_id: RoomId,
        message_id: MessageId,
        read_by: Vec<UserId>,
    },
    RoomUpdated {
        room: RoomSummary,
    },
    Error(ApiError),
}

impl ServerEvent {
    /// Room the event belongs to, for fan-out routing. `Error` is
    /// connection-local and carries no room.
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            Self::MessageReceived { message } => Some(message.room_id),
            Self::MessageStatusUpdated { room_id, .. } => Some(*room_id),
            Self::RoomUpdated { room } => Some(room.room_id),
            Self::Error(_) => None,
        }
    }
}
