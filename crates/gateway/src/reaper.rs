//! Background task: every 10 minutes, purge expired password-reset tokens
//! and delete rooms that have been inactive with no members for 10 minutes.

use std::{sync::Arc, time::Duration};

use watchroom_db::PersistenceGateway;

use crate::registry::ConnectionRegistry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub async fn run(db: Arc<dyn PersistenceGateway>, registry: Arc<ConnectionRegistry>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sweep_once(&db, &registry).await;
    }
}

async fn sweep_once(db: &Arc<dyn PersistenceGateway>, registry: &Arc<ConnectionRegistry>) {
    if let Err(e) = db.purge_expired_reset_tokens().await {
        tracing::warn!(error = %e, "reaper: failed to purge expired reset tokens, will retry next tick");
    }

    let inactive = match db.find_inactive_rooms().await {
        Ok(rooms) => rooms,
        Err(e) => {
            tracing::warn!(error = %e, "reaper: failed to list inactive rooms, will retry next tick");
            return;
        },
    };

    for room_id in inactive {
        if registry.room_has_members(&room_id) {
            continue;
        }
        if let Err(e) = db.delete_room(&room_id).await {
            tracing::warn!(error = %e, room_id, "reaper: failed to delete inactive room");
        } else {
            registry.remove_empty_room(&room_id);
            tracing::debug!(room_id, "reaper: deleted inactive room");
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use uuid::Uuid;
    use watchroom_db::{ChatMessage, PersistenceGateway, PlayerState, Room};

    use super::*;

    /// Stubs only the operations the reaper calls; every other trait method
    /// is unreachable from these tests.
    #[derive(Default)]
    struct FakeGateway {
        inactive_rooms: Vec<String>,
        deleted: Mutex<Vec<String>>,
        purge_calls: Mutex<u32>,
        purge_fails: bool,
    }

    #[async_trait]
    impl PersistenceGateway for FakeGateway {
        async fn find_room(&self, _id: &str) -> watchroom_common::Result<Room> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn find_chat(&self, _room_id: &str) -> watchroom_common::Result<Vec<ChatMessage>> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn find_subtitle_names(&self, _room_id: &str) -> watchroom_common::Result<Vec<String>> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn find_subtitle(&self, _room_id: &str, _name: &str) -> watchroom_common::Result<Vec<u8>> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn insert_chat(
            &self,
            _room_id: &str,
            _user_id: Option<uuid::Uuid>,
            _message: &str,
        ) -> watchroom_common::Result<ChatMessage> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn update_room_state(
            &self,
            _room_id: &str,
            _state: PlayerState,
            _last_action: chrono::DateTime<chrono::Utc>,
        ) -> watchroom_common::Result<()> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn update_room(
            &self,
            _id: &str,
            _room_type: &str,
            _target: &str,
        ) -> watchroom_common::Result<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)>
        {
            unimplemented!("not exercised by reaper tests")
        }
        async fn insert_subtitle(&self, _room_id: &str, _name: &str, _data: &[u8]) -> watchroom_common::Result<()> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn insert_room(&self, _id: &str, _room_type: &str, _target: &str) -> watchroom_common::Result<Room> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn find_inactive_rooms(&self) -> watchroom_common::Result<Vec<String>> {
            Ok(self.inactive_rooms.clone())
        }
        async fn delete_room(&self, id: &str) -> watchroom_common::Result<()> {
            self.deleted.lock().unwrap().push(id.to_string());
            Ok(())
        }
        async fn purge_expired_reset_tokens(&self) -> watchroom_common::Result<()> {
            *self.purge_calls.lock().unwrap() += 1;
            if self.purge_fails {
                return Err(watchroom_common::Error::internal(anyhow::anyhow!("db down")));
            }
            Ok(())
        }
        async fn find_user_by_id(&self, _id: uuid::Uuid) -> watchroom_common::Result<watchroom_db::User> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn find_user_by_username(&self, _username: &str) -> watchroom_common::Result<watchroom_db::User> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn find_user_by_email(&self, _email: &str) -> watchroom_common::Result<watchroom_db::User> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn insert_user(
            &self,
            _username: &str,
            _email: &str,
            _password_hash: &str,
        ) -> watchroom_common::Result<watchroom_db::User> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn update_user_password(&self, _user_id: uuid::Uuid, _password_hash: &str) -> watchroom_common::Result<()> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn update_username(&self, _user_id: uuid::Uuid, _username: &str) -> watchroom_common::Result<()> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn update_email(&self, _user_id: uuid::Uuid, _email: &str) -> watchroom_common::Result<()> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn update_avatar_digest(&self, _user_id: uuid::Uuid, _digest: Option<&str>) -> watchroom_common::Result<()> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn delete_user(&self, _user_id: uuid::Uuid) -> watchroom_common::Result<()> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn find_usernames(&self, _ids: &[uuid::Uuid]) -> watchroom_common::Result<Vec<(uuid::Uuid, String)>> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn insert_token(&self, _user_id: uuid::Uuid) -> watchroom_common::Result<watchroom_db::Token> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn find_token(&self, _token: &str) -> watchroom_common::Result<(watchroom_db::Token, watchroom_db::User)> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn delete_token(&self, _token: &str) -> watchroom_common::Result<()> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn delete_tokens_for_user(&self, _user_id: uuid::Uuid) -> watchroom_common::Result<()> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn insert_password_reset_token(
            &self,
            _user_id: uuid::Uuid,
        ) -> watchroom_common::Result<watchroom_db::PasswordResetToken> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn find_password_reset_token(
            &self,
            _id: uuid::Uuid,
        ) -> watchroom_common::Result<watchroom_db::PasswordResetToken> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn delete_password_reset_token(&self, _id: uuid::Uuid) -> watchroom_common::Result<()> {
            unimplemented!("not exercised by reaper tests")
        }
        async fn recent_reset_token_exists(&self, _user_id: uuid::Uuid) -> watchroom_common::Result<bool> {
            unimplemented!("not exercised by reaper tests")
        }
    }

    #[tokio::test]
    async fn deletes_inactive_room_with_no_members() {
        let fake = Arc::new(FakeGateway {
            inactive_rooms: vec!["r1".to_string()],
            ..Default::default()
        });
        let db: Arc<dyn PersistenceGateway> = fake.clone();
        let registry = ConnectionRegistry::new();

        sweep_once(&db, &registry).await;

        assert_eq!(*fake.deleted.lock().unwrap(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn skips_inactive_room_that_still_has_members() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let sink = crate::registry::Sink::new(tx);
        let registry = ConnectionRegistry::new();
        registry.register("r1", (Uuid::nil(), "c".to_string()), "tok", sink);

        let fake = Arc::new(FakeGateway {
            inactive_rooms: vec!["r1".to_string()],
            ..Default::default()
        });
        let db: Arc<dyn PersistenceGateway> = fake.clone();

        sweep_once(&db, &registry).await;

        assert!(fake.deleted.lock().unwrap().is_empty());
        assert!(registry.room_has_members("r1"));
    }

    #[tokio::test]
    async fn tolerates_purge_failure_and_still_sweeps_rooms() {
        let fake = Arc::new(FakeGateway {
            inactive_rooms: vec!["r1".to_string()],
            purge_fails: true,
            ..Default::default()
        });
        let db: Arc<dyn PersistenceGateway> = fake.clone();
        let registry = ConnectionRegistry::new();

        sweep_once(&db, &registry).await;

        assert_eq!(*fake.purge_calls.lock().unwrap(), 1);
        assert_eq!(*fake.deleted.lock().unwrap(), vec!["r1".to_string()]);
    }
}
