use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::incoming::PlayerStateData;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfoWire {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub room_type: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageWire {
    pub id: i64,
    pub user_id: Uuid,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Every frame the server ever sends, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    RoomInfo(RoomInfoWire),
    PlayerState { data: PlayerStateData },
    Chat { data: Vec<ChatMessageWire> },
    Subtitle { data: Vec<String> },
    Typing { user_id: Uuid, timestamp: i64 },
    Pong { timestamp: i64 },
    UserProfileUpdate { id: Uuid, data: ProfileUpdateData },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdateData {
    pub avatar: Option<String>,
}
