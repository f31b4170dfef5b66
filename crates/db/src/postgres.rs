use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    error_map::{map_sqlx_error, map_sqlx_error_nf},
    gateway::PersistenceGateway,
    models::{ChatMessage, PasswordResetToken, PlayerState, Room, Token, User},
};

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id              UUID PRIMARY KEY,
    username        TEXT NOT NULL UNIQUE,
    email           TEXT NOT NULL UNIQUE,
    password_hash   TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    verified        BOOLEAN NOT NULL DEFAULT false,
    avatar_digest   TEXT
);

CREATE TABLE IF NOT EXISTS tokens (
    token      CHAR(128) PRIMARY KEY,
    user_id    UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS rooms (
    id          VARCHAR(24) PRIMARY KEY,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    modified_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    room_type   TEXT NOT NULL DEFAULT '',
    target      TEXT NOT NULL DEFAULT '',
    paused      BOOLEAN NOT NULL DEFAULT true,
    speed       DOUBLE PRECISION NOT NULL DEFAULT 1,
    timestamp   DOUBLE PRECISION NOT NULL DEFAULT 0,
    last_action TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id        BIGSERIAL PRIMARY KEY,
    room_id   VARCHAR(24) NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    user_id   UUID REFERENCES users(id) ON DELETE SET NULL,
    message   TEXT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS subtitles (
    room_id VARCHAR(24) NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    name    TEXT NOT NULL,
    data    BYTEA NOT NULL,
    PRIMARY KEY (room_id, name)
);

CREATE TABLE IF NOT EXISTS password_reset_tokens (
    id         UUID PRIMARY KEY,
    user_id    UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

pub struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
        sqlx::raw_sql(MIGRATIONS).execute(pool).await?;
        Ok(())
    }

    fn room_from_row(row: &sqlx::postgres::PgRow) -> Room {
        Room {
            id: row.get("id"),
            created_at: row.get("created_at"),
            modified_at: row.get("modified_at"),
            room_type: row.get("room_type"),
            target: row.get("target"),
            player_state: PlayerState {
                paused: row.get("paused"),
                speed: row.get("speed"),
                timestamp: row.get("timestamp"),
            },
            last_action: row.get("last_action"),
        }
    }

    fn user_from_row(row: &sqlx::postgres::PgRow) -> User {
        User {
            id: row.get("id"),
            username: row.get("username"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            created_at: row.get("created_at"),
            verified: row.get("verified"),
            avatar_digest: row.get("avatar_digest"),
        }
    }

    fn chat_from_row(row: &sqlx::postgres::PgRow) -> ChatMessage {
        ChatMessage {
            id: row.get("id"),
            room_id: row.get("room_id"),
            user_id: row.get("user_id"),
            message: row.get("message"),
            timestamp: row.get("timestamp"),
        }
    }
}

#[async_trait]
impl PersistenceGateway for PostgresGateway {
    async fn find_room(&self, id: &str) -> watchroom_common::Result<Room> {
        sqlx::query("SELECT * FROM rooms WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?
            .map(|row| Self::room_from_row(&row))
            .ok_or_else(|| watchroom_common::Error::NotFound("Room not found!".to_string()))
    }

    async fn find_chat(&self, room_id: &str) -> watchroom_common::Result<Vec<ChatMessage>> {
        let rows = sqlx::query("SELECT * FROM chat_messages WHERE room_id = $1 ORDER BY id ASC")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok(rows.iter().map(Self::chat_from_row).collect())
    }

    async fn find_subtitle_names(&self, room_id: &str) -> watchroom_common::Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM subtitles WHERE room_id = $1 ORDER BY name ASC")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }

    async fn find_subtitle(&self, room_id: &str, name: &str) -> watchroom_common::Result<Vec<u8>> {
        sqlx::query("SELECT data FROM subtitles WHERE room_id = $1 AND name = $2")
            .bind(room_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Subtitle not found!"))?
            .map(|row| row.get("data"))
            .ok_or_else(|| watchroom_common::Error::NotFound("Subtitle not found!".to_string()))
    }

    async fn insert_chat(
        &self,
        room_id: &str,
        user_id: Option<Uuid>,
        message: &str,
    ) -> watchroom_common::Result<ChatMessage> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        let row = sqlx::query(
            "INSERT INTO chat_messages (room_id, user_id, message) VALUES ($1, $2, $3)
             RETURNING id, room_id, user_id, message, timestamp",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(message)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        sqlx::query("UPDATE rooms SET modified_at = now() WHERE id = $1")
            .bind(room_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok(Self::chat_from_row(&row))
    }

    async fn update_room_state(
        &self,
        room_id: &str,
        state: PlayerState,
        last_action: DateTime<Utc>,
    ) -> watchroom_common::Result<()> {
        let result = sqlx::query(
            "UPDATE rooms SET paused = $1, speed = $2, timestamp = $3, last_action = $4,
             modified_at = now() WHERE id = $5",
        )
        .bind(state.paused)
        .bind(state.speed)
        .bind(state.timestamp)
        .bind(last_action)
        .bind(room_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        if result.rows_affected() != 1 {
            return Err(watchroom_common::Error::internal(anyhow::anyhow!(
                "player_state update affected {} rows for room {room_id}",
                result.rows_affected()
            )));
        }
        Ok(())
    }

    async fn update_room(
        &self,
        id: &str,
        room_type: &str,
        target: &str,
    ) -> watchroom_common::Result<(DateTime<Utc>, DateTime<Utc>)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        sqlx::query("DELETE FROM subtitles WHERE room_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        let row = sqlx::query(
            "UPDATE rooms SET room_type = $1, target = $2, paused = true, speed = 1,
             timestamp = 0, last_action = now(), modified_at = now()
             WHERE id = $3
             RETURNING created_at, modified_at",
        )
        .bind(room_type)
        .bind(target)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?
        .ok_or_else(|| watchroom_common::Error::NotFound("Room not found!".to_string()))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok((row.get("created_at"), row.get("modified_at")))
    }

    async fn insert_subtitle(
        &self,
        room_id: &str,
        name: &str,
        data: &[u8],
    ) -> watchroom_common::Result<()> {
        let result = sqlx::query(
            "INSERT INTO subtitles (room_id, name, data) VALUES ($1, $2, $3)
             ON CONFLICT (room_id, name) DO UPDATE SET data = excluded.data",
        )
        .bind(room_id)
        .bind(name)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        if result.rows_affected() == 0 {
            return Err(watchroom_common::Error::NotFound("Room not found!".to_string()));
        }
        sqlx::query("UPDATE rooms SET modified_at = now() WHERE id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok(())
    }

    async fn insert_room(
        &self,
        id: &str,
        room_type: &str,
        target: &str,
    ) -> watchroom_common::Result<Room> {
        let row = sqlx::query(
            "INSERT INTO rooms (id, room_type, target) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(id)
        .bind(room_type)
        .bind(target)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "Room not found!", "This room id is already taken!"))?;
        Ok(Self::room_from_row(&row))
    }

    async fn find_inactive_rooms(&self) -> watchroom_common::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id FROM rooms WHERE modified_at < now() - interval '10 minutes'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    async fn delete_room(&self, id: &str) -> watchroom_common::Result<()> {
        sqlx::query("DELETE FROM rooms WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok(())
    }

    async fn purge_expired_reset_tokens(&self) -> watchroom_common::Result<()> {
        sqlx::query(
            "DELETE FROM password_reset_tokens WHERE created_at < now() - interval '10 minutes'",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error_nf(e, ""))?;
        Ok(())
    }

    async fn find_user_by_id(&self, id: Uuid) -> watchroom_common::Result<User> {
        sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?
            .map(|row| Self::user_from_row(&row))
            .ok_or_else(|| watchroom_common::Error::NotFound("User not found!".to_string()))
    }

    async fn find_user_by_username(&self, username: &str) -> watchroom_common::Result<User> {
        sqlx::query("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?
            .map(|row| Self::user_from_row(&row))
            .ok_or_else(|| watchroom_common::Error::NotFound("User not found!".to_string()))
    }

    async fn find_user_by_email(&self, email: &str) -> watchroom_common::Result<User> {
        sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?
            .map(|row| Self::user_from_row(&row))
            .ok_or_else(|| watchroom_common::Error::NotFound("User not found!".to_string()))
    }

    async fn insert_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> watchroom_common::Result<User> {
        let id = Uuid::now_v7();
        let row = sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, verified) VALUES ($1, $2, $3, $4, true)
             RETURNING *",
        )
        .bind(id)
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            map_sqlx_error(
                e,
                "User not found!",
                "An account with this username already exists!",
            )
        })?;
        Ok(Self::user_from_row(&row))
    }

    async fn update_user_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
    ) -> watchroom_common::Result<()> {
        sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(password_hash)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?;
        Ok(())
    }

    async fn update_username(&self, user_id: Uuid, username: &str) -> watchroom_common::Result<()> {
        sqlx::query("UPDATE users SET username = $1 WHERE id = $2")
            .bind(username)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_sqlx_error(
                    e,
                    "User not found!",
                    "An account with this username already exists!",
                )
            })?;
        Ok(())
    }

    async fn update_email(&self, user_id: Uuid, email: &str) -> watchroom_common::Result<()> {
        sqlx::query("UPDATE users SET email = $1 WHERE id = $2")
            .bind(email)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_sqlx_error(e, "User not found!", "An account with this email already exists!")
            })?;
        Ok(())
    }

    async fn update_avatar_digest(
        &self,
        user_id: Uuid,
        digest: Option<&str>,
    ) -> watchroom_common::Result<()> {
        sqlx::query("UPDATE users SET avatar_digest = $1 WHERE id = $2")
            .bind(digest)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?;
        Ok(())
    }

    async fn delete_user(&self, user_id: Uuid) -> watchroom_common::Result<()> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?;
        Ok(())
    }

    async fn find_usernames(&self, ids: &[Uuid]) -> watchroom_common::Result<Vec<(Uuid, String)>> {
        let rows = sqlx::query("SELECT id, username FROM users WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, ""))?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("id"), r.get("username")))
            .collect())
    }

    async fn insert_token(&self, user_id: Uuid) -> watchroom_common::Result<Token> {
        let token = crate::token::generate_token();
        sqlx::query("INSERT INTO tokens (token, user_id) VALUES ($1, $2)")
            .bind(&token)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?;
        Ok(Token {
            token,
            user_id,
            created_at: Utc::now(),
        })
    }

    async fn find_token(&self, token: &str) -> watchroom_common::Result<(Token, User)> {
        let row = sqlx::query(
            "SELECT t.token, t.user_id, t.created_at,
                    u.id as u_id, u.username, u.email, u.password_hash, u.created_at as u_created_at,
                    u.verified, u.avatar_digest
             FROM tokens t JOIN users u ON u.id = t.user_id
             WHERE t.token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error_nf(e, "Invalid session."))?
        .ok_or_else(|| watchroom_common::Error::Unauthenticated("Invalid session.".to_string()))?;

        let token = Token {
            token: row.get("token"),
            user_id: row.get("user_id"),
            created_at: row.get("created_at"),
        };
        let user = User {
            id: row.get("u_id"),
            username: row.get("username"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            created_at: row.get("u_created_at"),
            verified: row.get("verified"),
            avatar_digest: row.get("avatar_digest"),
        };
        Ok((token, user))
    }

    async fn delete_token(&self, token: &str) -> watchroom_common::Result<()> {
        sqlx::query("DELETE FROM tokens WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, ""))?;
        Ok(())
    }

    async fn delete_tokens_for_user(&self, user_id: Uuid) -> watchroom_common::Result<()> {
        sqlx::query("DELETE FROM tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, ""))?;
        Ok(())
    }

    async fn insert_password_reset_token(
        &self,
        user_id: Uuid,
    ) -> watchroom_common::Result<PasswordResetToken> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO password_reset_tokens (id, user_id) VALUES ($1, $2)")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?;
        Ok(PasswordResetToken {
            id,
            user_id,
            created_at: Utc::now(),
        })
    }

    async fn find_password_reset_token(
        &self,
        id: Uuid,
    ) -> watchroom_common::Result<PasswordResetToken> {
        sqlx::query("SELECT * FROM password_reset_tokens WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "This password reset token has expired!"))?
            .map(|row| PasswordResetToken {
                id: row.get("id"),
                user_id: row.get("user_id"),
                created_at: row.get("created_at"),
            })
            .ok_or_else(|| {
                watchroom_common::Error::NotFound(
                    "This password reset token has expired!".to_string(),
                )
            })
    }

    async fn delete_password_reset_token(&self, id: Uuid) -> watchroom_common::Result<()> {
        sqlx::query("DELETE FROM password_reset_tokens WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, ""))?;
        Ok(())
    }

    async fn recent_reset_token_exists(&self, user_id: Uuid) -> watchroom_common::Result<bool> {
        let row = sqlx::query(
            "SELECT count(*) as n FROM password_reset_tokens
             WHERE user_id = $1 AND created_at > now() - interval '2 minutes'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error_nf(e, ""))?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }
}
