use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row};
use uuid::Uuid;

use crate::{
    error_map::{map_sqlx_error, map_sqlx_error_nf},
    gateway::PersistenceGateway,
    models::{ChatMessage, PasswordResetToken, PlayerState, Room, Token, User},
};

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id              BINARY(16) PRIMARY KEY,
        username        VARCHAR(16) NOT NULL UNIQUE,
        email           VARCHAR(320) NOT NULL UNIQUE,
        password_hash   VARCHAR(255) NOT NULL,
        created_at      DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        verified        BOOLEAN NOT NULL DEFAULT false,
        avatar_digest   VARCHAR(255)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tokens (
        token      CHAR(128) PRIMARY KEY,
        user_id    BINARY(16) NOT NULL,
        created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS rooms (
        id          VARCHAR(24) PRIMARY KEY,
        created_at  DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        modified_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        room_type   VARCHAR(32) NOT NULL DEFAULT '',
        target      VARCHAR(1024) NOT NULL DEFAULT '',
        paused      BOOLEAN NOT NULL DEFAULT true,
        speed       DOUBLE NOT NULL DEFAULT 1,
        timestamp   DOUBLE NOT NULL DEFAULT 0,
        last_action DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS chat_messages (
        id        BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        room_id   VARCHAR(24) NOT NULL,
        user_id   BINARY(16),
        message   VARCHAR(2000) NOT NULL,
        timestamp DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE,
        FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE SET NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS subtitles (
        room_id VARCHAR(24) NOT NULL,
        name    VARCHAR(255) NOT NULL,
        data    MEDIUMBLOB NOT NULL,
        PRIMARY KEY (room_id, name),
        FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS password_reset_tokens (
        id         BINARY(16) PRIMARY KEY,
        user_id    BINARY(16) NOT NULL,
        created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
        FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
    )"#,
];

pub struct MySqlGateway {
    pool: MySqlPool,
}

impl MySqlGateway {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(pool: &MySqlPool) -> anyhow::Result<()> {
        for stmt in MIGRATIONS {
            sqlx::query(stmt).execute(pool).await?;
        }
        Ok(())
    }

    fn room_from_row(row: &sqlx::mysql::MySqlRow) -> Room {
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

    fn user_from_row(row: &sqlx::mysql::MySqlRow) -> User {
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

    fn chat_from_row(row: &sqlx::mysql::MySqlRow) -> ChatMessage {
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
impl PersistenceGateway for MySqlGateway {
    async fn find_room(&self, id: &str) -> watchroom_common::Result<Room> {
        sqlx::query("SELECT * FROM rooms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?
            .map(|row| Self::room_from_row(&row))
            .ok_or_else(|| watchroom_common::Error::NotFound("Room not found!".to_string()))
    }

    async fn find_chat(&self, room_id: &str) -> watchroom_common::Result<Vec<ChatMessage>> {
        let rows = sqlx::query("SELECT * FROM chat_messages WHERE room_id = ? ORDER BY id ASC")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok(rows.iter().map(Self::chat_from_row).collect())
    }

    async fn find_subtitle_names(&self, room_id: &str) -> watchroom_common::Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM subtitles WHERE room_id = ? ORDER BY name ASC")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }

    async fn find_subtitle(&self, room_id: &str, name: &str) -> watchroom_common::Result<Vec<u8>> {
        sqlx::query("SELECT data FROM subtitles WHERE room_id = ? AND name = ?")
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
        let result = sqlx::query("INSERT INTO chat_messages (room_id, user_id, message) VALUES (?, ?, ?)")
            .bind(room_id)
            .bind(user_id)
            .bind(message)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        let id = result.last_insert_id() as i64;
        sqlx::query("UPDATE rooms SET modified_at = NOW(6) WHERE id = ?")
            .bind(room_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        let row = sqlx::query("SELECT * FROM chat_messages WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
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
            "UPDATE rooms SET paused = ?, speed = ?, timestamp = ?, last_action = ?,
             modified_at = NOW(6) WHERE id = ?",
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
        sqlx::query("DELETE FROM subtitles WHERE room_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        let result = sqlx::query(
            "UPDATE rooms SET room_type = ?, target = ?, paused = true, speed = 1,
             timestamp = 0, last_action = NOW(6), modified_at = NOW(6) WHERE id = ?",
        )
        .bind(room_type)
        .bind(target)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        if result.rows_affected() == 0 {
            return Err(watchroom_common::Error::NotFound("Room not found!".to_string()));
        }
        let row = sqlx::query("SELECT created_at, modified_at FROM rooms WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
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
        let exists = self.find_room(room_id).await;
        if exists.is_err() {
            return Err(watchroom_common::Error::NotFound("Room not found!".to_string()));
        }
        sqlx::query(
            "INSERT INTO subtitles (room_id, name, data) VALUES (?, ?, ?)
             ON DUPLICATE KEY UPDATE data = VALUES(data)",
        )
        .bind(room_id)
        .bind(name)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        sqlx::query("UPDATE rooms SET modified_at = NOW(6) WHERE id = ?")
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
        sqlx::query("INSERT INTO rooms (id, room_type, target) VALUES (?, ?, ?)")
            .bind(id)
            .bind(room_type)
            .bind(target)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "Room not found!", "This room id is already taken!"))?;
        self.find_room(id).await
    }

    async fn find_inactive_rooms(&self) -> watchroom_common::Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM rooms WHERE modified_at < NOW(6) - INTERVAL 10 MINUTE")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    async fn delete_room(&self, id: &str) -> watchroom_common::Result<()> {
        sqlx::query("DELETE FROM rooms WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "Room not found!"))?;
        Ok(())
    }

    async fn purge_expired_reset_tokens(&self) -> watchroom_common::Result<()> {
        sqlx::query("DELETE FROM password_reset_tokens WHERE created_at < NOW(6) - INTERVAL 10 MINUTE")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, ""))?;
        Ok(())
    }

    async fn find_user_by_id(&self, id: Uuid) -> watchroom_common::Result<User> {
        sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?
            .map(|row| Self::user_from_row(&row))
            .ok_or_else(|| watchroom_common::Error::NotFound("User not found!".to_string()))
    }

    async fn find_user_by_username(&self, username: &str) -> watchroom_common::Result<User> {
        sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?
            .map(|row| Self::user_from_row(&row))
            .ok_or_else(|| watchroom_common::Error::NotFound("User not found!".to_string()))
    }

    async fn find_user_by_email(&self, email: &str) -> watchroom_common::Result<User> {
        sqlx::query("SELECT * FROM users WHERE email = ?")
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
        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, verified) VALUES (?, ?, ?, ?, true)",
        )
            .bind(id)
            .bind(username)
            .bind(email)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_sqlx_error(
                    e,
                    "User not found!",
                    "An account with this username already exists!",
                )
            })?;
        self.find_user_by_id(id).await
    }

    async fn update_user_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
    ) -> watchroom_common::Result<()> {
        sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(password_hash)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?;
        Ok(())
    }

    async fn update_username(&self, user_id: Uuid, username: &str) -> watchroom_common::Result<()> {
        sqlx::query("UPDATE users SET username = ? WHERE id = ?")
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
        sqlx::query("UPDATE users SET email = ? WHERE id = ?")
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
        sqlx::query("UPDATE users SET avatar_digest = ? WHERE id = ?")
            .bind(digest)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?;
        Ok(())
    }

    async fn delete_user(&self, user_id: Uuid) -> watchroom_common::Result<()> {
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, "User not found!"))?;
        Ok(())
    }

    async fn find_usernames(&self, ids: &[Uuid]) -> watchroom_common::Result<Vec<(Uuid, String)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("SELECT id, username FROM users WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query
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
        sqlx::query("INSERT INTO tokens (token, user_id) VALUES (?, ?)")
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
             WHERE t.token = ?",
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
        sqlx::query("DELETE FROM tokens WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, ""))?;
        Ok(())
    }

    async fn delete_tokens_for_user(&self, user_id: Uuid) -> watchroom_common::Result<()> {
        sqlx::query("DELETE FROM tokens WHERE user_id = ?")
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
        sqlx::query("INSERT INTO password_reset_tokens (id, user_id) VALUES (?, ?)")
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
        sqlx::query("SELECT * FROM password_reset_tokens WHERE id = ?")
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
        sqlx::query("DELETE FROM password_reset_tokens WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error_nf(e, ""))?;
        Ok(())
    }

    async fn recent_reset_token_exists(&self, user_id: Uuid) -> watchroom_common::Result<bool> {
        let row = sqlx::query(
            "SELECT count(*) as n FROM password_reset_tokens
             WHERE user_id = ? AND created_at > NOW(6) - INTERVAL 2 MINUTE",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error_nf(e, ""))?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }
}
