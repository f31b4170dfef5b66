use serde::{Deserialize, Serialize};

/// First frame of every session; anything else as the first frame is a protocol error.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMessageIncoming {
    pub token: String,
    pub client_id: Option<String>,
    #[serde(default)]
    pub reconnect: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStateData {
    pub paused: bool,
    pub speed: f64,
    pub timestamp: f64,
    pub last_action: chrono::DateTime<chrono::Utc>,
}

/// Post-auth frames, dispatched by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    Chat { data: String },
    PlayerState { data: PlayerStateData },
    Typing { timestamp: i64 },
    Ping { timestamp: i64 },
}
