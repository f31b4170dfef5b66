use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{ChatMessage, PasswordResetToken, PlayerState, Room, Token, User};

/// Prepared-statement facade over a relational store. Implemented once per
/// supported backend (`PostgresGateway`, `MySqlGateway`); callers hold
/// `Arc<dyn PersistenceGateway>` and never branch on which one they have.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn find_room(&self, id: &str) -> watchroom_common::Result<Room>;
    async fn find_chat(&self, room_id: &str) -> watchroom_common::Result<Vec<ChatMessage>>;
    async fn find_subtitle_names(&self, room_id: &str) -> watchroom_common::Result<Vec<String>>;
    async fn find_subtitle(&self, room_id: &str, name: &str) -> watchroom_common::Result<Vec<u8>>;

    /// Inserts a chat row and atomically bumps `rooms.modified_at`.
    async fn insert_chat(
        &self,
        room_id: &str,
        user_id: Option<Uuid>,
        message: &str,
    ) -> watchroom_common::Result<ChatMessage>;

    async fn update_room_state(
        &self,
        room_id: &str,
        state: PlayerState,
        last_action: DateTime<Utc>,
    ) -> watchroom_common::Result<()>;

    /// Changes `(type, target)`, deletes all subtitles, resets player state.
    /// Returns the room's `(created_at, modified_at)` after the update.
    async fn update_room(
        &self,
        id: &str,
        room_type: &str,
        target: &str,
    ) -> watchroom_common::Result<(DateTime<Utc>, DateTime<Utc>)>;

    /// Upsert on `(room_id, name)`.
    async fn insert_subtitle(
        &self,
        room_id: &str,
        name: &str,
        data: &[u8],
    ) -> watchroom_common::Result<()>;

    async fn insert_room(
        &self,
        id: &str,
        room_type: &str,
        target: &str,
    ) -> watchroom_common::Result<Room>;

    /// Rooms with `modified_at` older than the 10-minute inactivity threshold.
    async fn find_inactive_rooms(&self) -> watchroom_common::Result<Vec<String>>;

    async fn delete_room(&self, id: &str) -> watchroom_common::Result<()>;

    async fn purge_expired_reset_tokens(&self) -> watchroom_common::Result<()>;

    // ── identity gate collaborators (§9) ──────────────────────────────

    async fn find_user_by_id(&self, id: Uuid) -> watchroom_common::Result<User>;
    async fn find_user_by_username(&self, username: &str) -> watchroom_common::Result<User>;
    async fn find_user_by_email(&self, email: &str) -> watchroom_common::Result<User>;
    async fn insert_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> watchroom_common::Result<User>;
    async fn update_user_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
    ) -> watchroom_common::Result<()>;
    async fn update_username(&self, user_id: Uuid, username: &str) -> watchroom_common::Result<()>;
    async fn update_email(&self, user_id: Uuid, email: &str) -> watchroom_common::Result<()>;
    async fn update_avatar_digest(
        &self,
        user_id: Uuid,
        digest: Option<&str>,
    ) -> watchroom_common::Result<()>;
    async fn delete_user(&self, user_id: Uuid) -> watchroom_common::Result<()>;
    async fn find_usernames(&self, ids: &[Uuid]) -> watchroom_common::Result<Vec<(Uuid, String)>>;

    async fn insert_token(&self, user_id: Uuid) -> watchroom_common::Result<Token>;
    /// Resolves a bearer token to its owning user, or `Unauthenticated`.
    async fn find_token(&self, token: &str) -> watchroom_common::Result<(Token, User)>;
    async fn delete_token(&self, token: &str) -> watchroom_common::Result<()>;
    async fn delete_tokens_for_user(&self, user_id: Uuid) -> watchroom_common::Result<()>;

    async fn insert_password_reset_token(
        &self,
        user_id: Uuid,
    ) -> watchroom_common::Result<PasswordResetToken>;
    async fn find_password_reset_token(
        &self,
        id: Uuid,
    ) -> watchroom_common::Result<PasswordResetToken>;
    async fn delete_password_reset_token(&self, id: Uuid) -> watchroom_common::Result<()>;
    /// Rate limit: has this user requested a reset in the last 2 minutes?
    async fn recent_reset_token_exists(&self, user_id: Uuid) -> watchroom_common::Result<bool>;
}
