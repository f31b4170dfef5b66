//! In-memory connection registry: `room -> {conn_id -> sink}` and
//! `user -> {sink -> (room_id, token)}`. Both maps are `dashmap::DashMap`,
//! chosen because the registry's hot path must never suspend — see
//! the concurrency notes on [`ConnectionRegistry`].

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use watchroom_protocol::OutgoingMessage;

/// `(user_id, client_id)` — the unit of "one logical client instance in one room".
pub type ConnId = (Uuid, String);

/// Frames sent to a connection's writer task. The two control sentinels
/// short-circuit the writer: `AuthDisconnect` closes 4401 after notifying
/// the client, `ClientReconnect` closes 4401 silently.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Message(OutgoingMessage),
    AuthDisconnect,
    ClientReconnect,
}

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// The enqueue side of a connection's bounded outbound queue. Comparable by
/// identity (an allocation-time counter), not by channel value, so the
/// registry's "delete-if-still-mine" unregister guard works under takeover.
#[derive(Debug, Clone)]
pub struct Sink {
    id: u64,
    tx: mpsc::Sender<SinkEvent>,
}

impl Sink {
    pub fn new(tx: mpsc::Sender<SinkEvent>) -> Self {
        Self {
            id: NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Best-effort enqueue; a full or closed queue drops the frame rather
    /// than blocking the caller (broadcast producers must not suspend).
    pub fn try_send(&self, event: SinkEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::debug!(sink_id = self.id, "outbound queue full or closed, dropping frame");
        }
    }
}

impl PartialEq for Sink {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Sink {}

struct UserEntry {
    room_id: String,
    token: String,
    sink: Sink,
}

/// Shared concurrent maps backing the registry's four atomic operations.
/// No external lock is required; see module docs.
#[derive(Default)]
pub struct ConnectionRegistry {
    rooms: DashMap<String, DashMap<ConnId, Sink>>,
    users: DashMap<Uuid, DashMap<u64, UserEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current number of live connections for a user, across all rooms.
    pub fn user_connection_count(&self, user_id: Uuid) -> usize {
        self.users.get(&user_id).map(|m| m.len()).unwrap_or(0)
    }

    /// Registers `sink` under `conn_id` in `room_id`. If a connection with
    /// the same `conn_id` already existed, it is evicted with a
    /// `ClientReconnect` signal and `preexisted=true` is returned.
    pub fn register(
        &self,
        room_id: &str,
        conn_id: ConnId,
        token: &str,
        sink: Sink,
    ) -> bool {
        let room = self.rooms.entry(room_id.to_string()).or_default();
        let preexisted = if let Some((_, old)) = room.remove(&conn_id) {
            old.try_send(SinkEvent::ClientReconnect);
            true
        } else {
            false
        };
        room.insert(conn_id.clone(), sink.clone());
        drop(room);

        let user_bucket = self.users.entry(conn_id.0).or_default();
        user_bucket.insert(sink.id, UserEntry {
            room_id: room_id.to_string(),
            token: token.to_string(),
            sink,
        });
        preexisted
    }

    /// Removes `sink` from both maps. The room entry for `conn_id` is only
    /// removed if it still points at this exact sink — guards against a
    /// takeover by a newer connection racing the same unregister.
    pub fn unregister(&self, room_id: &str, conn_id: &ConnId, sink: &Sink) {
        if let Some(user_bucket) = self.users.get(&conn_id.0) {
            user_bucket.remove(&sink.id);
            let empty = user_bucket.is_empty();
            drop(user_bucket);
            if empty {
                self.users.remove_if(&conn_id.0, |_, m| m.is_empty());
            }
        }

        if let Some(room) = self.rooms.get(room_id) {
            room.remove_if(conn_id, |_, v| v == sink);
        }
    }

    /// Best-effort concurrent iteration over a room's members; no strict
    /// snapshot guarantee (see module docs on broadcast ordering).
    pub fn broadcast_room(&self, room_id: &str, event: SinkEvent) {
        if let Some(room) = self.rooms.get(room_id) {
            for entry in room.iter() {
                entry.value().try_send(event.clone());
            }
        }
    }

    /// Like [`Self::broadcast_room`] but skips one connection (self-exclusion
    /// for `player_state`/`typing`).
    pub fn broadcast_room_except(&self, room_id: &str, except: &ConnId, event: SinkEvent) {
        if let Some(room) = self.rooms.get(room_id) {
            for entry in room.iter() {
                if entry.key() != except {
                    entry.value().try_send(event.clone());
                }
            }
        }
    }

    /// Whether the room's member map is present and non-empty — the reaper
    /// only deletes a room when this is false.
    pub fn room_has_members(&self, room_id: &str) -> bool {
        self.rooms.get(room_id).map(|m| !m.is_empty()).unwrap_or(false)
    }

    /// Drops the room's (empty) member map entry after the reaper deletes
    /// the room row. No-op if the map is absent or has since gained members.
    pub fn remove_empty_room(&self, room_id: &str) {
        self.rooms.remove_if(room_id, |_, m| m.is_empty());
    }

    /// Sends `AuthDisconnect` to every session of `user_id` whose stored
    /// token equals `token_match`. Used by logout.
    pub fn disconnect_user_sessions(&self, user_id: Uuid, token_match: &str) {
        if let Some(bucket) = self.users.get(&user_id) {
            for entry in bucket.iter() {
                if crate::auth::safe_equal(&entry.value().token, token_match) {
                    entry.value().sink.try_send(SinkEvent::AuthDisconnect);
                }
            }
        }
    }

    /// Distinct room ids a user currently has a live connection in (used by
    /// the avatar-change cross-room notifier).
    pub fn user_room_ids(&self, user_id: Uuid) -> Vec<String> {
        let Some(bucket) = self.users.get(&user_id) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = bucket.iter().map(|e| e.value().room_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (Sink, mpsc::Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (Sink::new(tx), rx)
    }

    #[tokio::test]
    async fn register_then_unregister_clears_both_maps() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conn_id: ConnId = (user, "client-a".to_string());
        let (s, _rx) = sink();

        let preexisted = registry.register("room1", conn_id.clone(), "tok", s.clone());
        assert!(!preexisted);
        assert_eq!(registry.user_connection_count(user), 1);
        assert!(registry.room_has_members("room1"));

        registry.unregister("room1", &conn_id, &s);
        assert_eq!(registry.user_connection_count(user), 0);
        assert!(!registry.room_has_members("room1"));
    }

    #[tokio::test]
    async fn same_conn_id_takeover_evicts_prior_sink_silently() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conn_id: ConnId = (user, "client-a".to_string());
        let (old_sink, mut old_rx) = sink();
        let (new_sink, _new_rx) = sink();

        registry.register("room1", conn_id.clone(), "tok", old_sink.clone());
        let preexisted = registry.register("room1", conn_id.clone(), "tok", new_sink.clone());
        assert!(preexisted);

        let evicted = old_rx.recv().await.expect("old sink notified");
        assert!(matches!(evicted, SinkEvent::ClientReconnect));
        // Only the new sink remains registered under this conn_id / user.
        assert_eq!(registry.user_connection_count(user), 1);
    }

    #[tokio::test]
    async fn unregister_does_not_evict_a_newer_sink_with_same_conn_id() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conn_id: ConnId = (user, "client-a".to_string());
        let (old_sink, _old_rx) = sink();
        let (new_sink, _new_rx) = sink();

        registry.register("room1", conn_id.clone(), "tok", old_sink.clone());
        registry.register("room1", conn_id.clone(), "tok", new_sink.clone());

        // A delayed unregister for the stale old sink must not remove the
        // newer registration — this is the "delete-if-still-mine" guard.
        registry.unregister("room1", &conn_id, &old_sink);
        assert!(registry.room_has_members("room1"));
    }

    #[tokio::test]
    async fn broadcast_room_except_skips_only_the_named_connection() {
        let registry = ConnectionRegistry::new();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let conn_a: ConnId = (user_a, "ca".to_string());
        let conn_b: ConnId = (user_b, "cb".to_string());
        let (sink_a, mut rx_a) = sink();
        let (sink_b, mut rx_b) = sink();

        registry.register("room1", conn_a.clone(), "tok", sink_a);
        registry.register("room1", conn_b.clone(), "tok", sink_b);

        registry.broadcast_room_except(
            "room1",
            &conn_a,
            SinkEvent::Message(OutgoingMessage::Pong { timestamp: 1 }),
        );

        assert!(rx_a.try_recv().is_err(), "sender must not see its own broadcast");
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            SinkEvent::Message(OutgoingMessage::Pong { timestamp: 1 })
        ));
    }

    #[tokio::test]
    async fn disconnect_user_sessions_only_matches_named_token() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conn_a: ConnId = (user, "ca".to_string());
        let conn_b: ConnId = (user, "cb".to_string());
        let (sink_a, mut rx_a) = sink();
        let (sink_b, mut rx_b) = sink();

        registry.register("room1", conn_a, "tok-a", sink_a);
        registry.register("room2", conn_b, "tok-b", sink_b);

        registry.disconnect_user_sessions(user, "tok-a");

        assert!(matches!(rx_a.try_recv().unwrap(), SinkEvent::AuthDisconnect));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_empty_room_drops_the_map_entry_only_when_empty() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conn_id: ConnId = (user, "client-a".to_string());
        let (s, _rx) = sink();

        registry.register("room1", conn_id.clone(), "tok", s.clone());
        registry.remove_empty_room("room1");
        assert!(registry.rooms.contains_key("room1"), "non-empty room must survive");

        registry.unregister("room1", &conn_id, &s);
        registry.remove_empty_room("room1");
        assert!(!registry.rooms.contains_key("room1"));
    }
}
