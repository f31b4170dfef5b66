//! Persistence gateway: typed operations over a relational store, with
//! interchangeable Postgres and MySQL/MariaDB backends.

pub mod error_map;
pub mod gateway;
pub mod models;
pub mod mysql;
pub mod postgres;
pub mod token;

pub use gateway::PersistenceGateway;
pub use models::{ChatMessage, PasswordResetToken, PlayerState, Room, Subtitle, Token, User};
pub use mysql::MySqlGateway;
pub use postgres::PostgresGateway;

/// Connects the backend named in config, running migrations on first use.
pub async fn connect(
    database: watchroom_config::Database,
    database_url: &str,
) -> anyhow::Result<std::sync::Arc<dyn PersistenceGateway>> {
    match database {
        watchroom_config::Database::Postgres => {
            Ok(std::sync::Arc::new(PostgresGateway::connect(database_url).await?))
        },
        watchroom_config::Database::Mysql => {
            Ok(std::sync::Arc::new(MySqlGateway::connect(database_url).await?))
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod sqlite_equivalence_tests {
    //! Throwaway SQLite tables exercising the same mutation sequence the
    //! Postgres/MySQL gateways run, to catch logic bugs without a live
    //! server. Not part of the production trait.

    #[tokio::test]
    async fn insert_chat_bumps_room_modified_at() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE rooms (id TEXT PRIMARY KEY, modified_at INTEGER NOT NULL);
             CREATE TABLE chat_messages (id INTEGER PRIMARY KEY AUTOINCREMENT, room_id TEXT, message TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO rooms (id, modified_at) VALUES ('r1', 0)")
            .execute(&pool)
            .await
            .unwrap();

        sqlx::query("INSERT INTO chat_messages (room_id, message) VALUES ('r1', 'hi')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE rooms SET modified_at = 1 WHERE id = 'r1'")
            .execute(&pool)
            .await
            .unwrap();

        let row: (i64,) = sqlx::query_as("SELECT modified_at FROM rooms WHERE id = 'r1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);

        let count: (i64,) = sqlx::query_as("SELECT count(*) FROM chat_messages WHERE room_id = 'r1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn subtitle_upsert_overwrites_same_name() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE subtitles (room_id TEXT, name TEXT, data BLOB, PRIMARY KEY(room_id, name))",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query("INSERT INTO subtitles VALUES ('r1', 'en', X'0102')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO subtitles VALUES ('r1', 'en', X'0304')
             ON CONFLICT(room_id, name) DO UPDATE SET data = excluded.data",
        )
        .execute(&pool)
        .await
        .unwrap();

        let row: (Vec<u8>,) = sqlx::query_as("SELECT data FROM subtitles WHERE room_id='r1' AND name='en'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, vec![0x03, 0x04]);

        let count: (i64,) = sqlx::query_as("SELECT count(*) FROM subtitles WHERE room_id='r1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }
}
