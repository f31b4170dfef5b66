//! The WebSocket join flow: one execution of this module's `run` function
//! per accepted connection, start to finish.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

use watchroom_common::Error;
use watchroom_db::PersistenceGateway;
use watchroom_protocol::{
    incoming::{AuthMessageIncoming, IncomingMessage},
    outgoing::{ChatMessageWire, OutgoingMessage, RoomInfoWire},
    SYSTEM_USER_ID,
};

use crate::registry::{ConnId, ConnectionRegistry, Sink, SinkEvent};

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE_CAPACITY: usize = 16;
const MAX_ROOMS_PER_USER: usize = 3;

fn chat_wire(msg: watchroom_db::ChatMessage) -> ChatMessageWire {
    ChatMessageWire {
        id: msg.id,
        user_id: msg.user_id.unwrap_or(SYSTEM_USER_ID),
        message: msg.message,
        timestamp: msg.timestamp,
    }
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

/// Drives a single accepted WebSocket connection through its entire
/// lifecycle: auth, snapshot, registration, read loop, teardown.
pub async fn run(
    socket: WebSocket,
    room_id: String,
    registry: Arc<ConnectionRegistry>,
    db: Arc<dyn PersistenceGateway>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // 2. Auth.
    let auth_msg = match tokio::time::timeout(READ_TIMEOUT, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AuthMessageIncoming>(&text) {
            Ok(m) => m,
            Err(_) => {
                let _ = ws_tx.send(close_frame(1002, "bad auth frame")).await;
                return;
            },
        },
        _ => {
            let _ = ws_tx.send(close_frame(1002, "auth timeout or closed")).await;
            return;
        },
    };

    let (token, user) = match db.find_token(&auth_msg.token).await {
        Ok(pair) => pair,
        Err(_) => {
            let _ = ws_tx.send(close_frame(4401, "unauthenticated")).await;
            return;
        },
    };

    if registry.user_connection_count(user.id) >= MAX_ROOMS_PER_USER {
        let _ = ws_tx.send(close_frame(4429, "too many rooms")).await;
        return;
    }

    // 3. Room snapshot.
    let room = match db.find_room(&room_id).await {
        Ok(r) => r,
        Err(Error::NotFound(_)) => {
            let _ = ws_tx.send(close_frame(4404, "room not found")).await;
            return;
        },
        Err(_) => {
            let _ = ws_tx.send(close_frame(1011, "internal error")).await;
            return;
        },
    };
    let chat_history = match db.find_chat(&room_id).await {
        Ok(c) => c,
        Err(_) => {
            let _ = ws_tx.send(close_frame(1011, "internal error")).await;
            return;
        },
    };
    let subtitle_names = match db.find_subtitle_names(&room_id).await {
        Ok(s) => s,
        Err(_) => {
            let _ = ws_tx.send(close_frame(1011, "internal error")).await;
            return;
        },
    };

    // 4. Initial push — four direct writes, ahead of registration and the
    // writer task, each under its own timeout.
    let initial = [
        OutgoingMessage::RoomInfo(RoomInfoWire {
            id: room.id.clone(),
            created_at: room.created_at,
            modified_at: room.modified_at,
            room_type: room.room_type.clone(),
            target: room.target.clone(),
        }),
        OutgoingMessage::PlayerState {
            data: watchroom_protocol::incoming::PlayerStateData {
                paused: room.player_state.paused,
                speed: room.player_state.speed,
                timestamp: room.player_state.timestamp,
                last_action: room.last_action,
            },
        },
        OutgoingMessage::Chat {
            data: chat_history.into_iter().map(chat_wire).collect(),
        },
        OutgoingMessage::Subtitle { data: subtitle_names },
    ];
    for frame in initial {
        let Ok(text) = serde_json::to_string(&frame) else {
            continue;
        };
        match tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => {},
            _ => {
                let _ = ws_tx.send(close_frame(1002, "initial push failed")).await;
                return;
            },
        }
    }

    // 5. Register.
    let client_id = auth_msg
        .client_id
        .clone()
        .unwrap_or_else(random_client_id);
    let conn_id: ConnId = (user.id, client_id);
    let (tx, rx) = mpsc::channel::<SinkEvent>(OUTBOUND_QUEUE_CAPACITY);
    let sink = Sink::new(tx);
    let preexisted = registry.register(&room_id, conn_id.clone(), &token.token, sink.clone());

    // 6. Writer task.
    let silently_disconnect = Arc::new(AtomicBool::new(false));
    let writer_flag = Arc::clone(&silently_disconnect);
    let writer = tokio::spawn(async move { writer_task(ws_tx, rx, writer_flag).await });

    // 7. Presence announce.
    if !preexisted {
        let verb = if auth_msg.reconnect { "reconnected" } else { "joined" };
        announce(&db, &registry, &room_id, user.id, verb).await;
    }

    // 8. Read loop.
    let mut close_code = None;
    loop {
        match tokio::time::timeout(READ_TIMEOUT, ws_rx.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Err(e) = dispatch(&text, &db, &registry, &room_id, &conn_id, &sink).await {
                    if matches!(e, Error::Internal(_)) {
                        sink.try_send(SinkEvent::Message(OutgoingMessage::Error {
                            message: e.message(),
                        }));
                        break;
                    }
                    sink.try_send(SinkEvent::Message(OutgoingMessage::Error {
                        message: e.message(),
                    }));
                }
            },
            Ok(Some(Ok(Message::Close(frame)))) => {
                close_code = frame.map(|f| f.code);
                break;
            },
            Ok(Some(Ok(_))) => {
                // Binary/ping/pong frames aren't part of the protocol; ignore.
            },
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_elapsed) => continue, // read timeout is not fatal
        }
    }

    // 9. Exit.
    registry.unregister(&room_id, &conn_id, &sink);
    writer.abort();

    if silently_disconnect.load(Ordering::SeqCst) {
        return;
    }
    let verb = match close_code {
        Some(1000) | Some(1001) => "left",
        _ => "was disconnected",
    };
    announce(&db, &registry, &room_id, user.id, verb).await;
}

async fn announce(
    db: &Arc<dyn PersistenceGateway>,
    registry: &Arc<ConnectionRegistry>,
    room_id: &str,
    user_id: Uuid,
    verb: &str,
) {
    let message = format!("{user_id} {verb}");
    match db.insert_chat(room_id, None, &message).await {
        Ok(row) => {
            registry.broadcast_room(
                room_id,
                SinkEvent::Message(OutgoingMessage::Chat { data: vec![chat_wire(row)] }),
            );
        },
        Err(e) => tracing::warn!(error = %e, room_id, "failed to insert presence message"),
    }
}

async fn dispatch(
    text: &str,
    db: &Arc<dyn PersistenceGateway>,
    registry: &Arc<ConnectionRegistry>,
    room_id: &str,
    conn_id: &ConnId,
    sink: &Sink,
) -> watchroom_common::Result<()> {
    let msg: IncomingMessage = serde_json::from_str(text)
        .map_err(|_| Error::BadInput("Invalid message.".to_string()))?;

    match msg {
        IncomingMessage::Chat { data } => {
            let Some(trimmed) = watchroom_protocol::validation::validate_chat_message(&data)
            else {
                return Ok(());
            };
            let row = db.insert_chat(room_id, Some(conn_id.0), &trimmed).await?;
            registry.broadcast_room(
                room_id,
                SinkEvent::Message(OutgoingMessage::Chat { data: vec![chat_wire(row)] }),
            );
        },
        IncomingMessage::PlayerState { data } => {
            let state = watchroom_db::PlayerState {
                paused: data.paused,
                speed: data.speed,
                timestamp: data.timestamp,
            };
            db.update_room_state(room_id, state, data.last_action).await?;
            registry.broadcast_room_except(
                room_id,
                conn_id,
                SinkEvent::Message(OutgoingMessage::PlayerState { data }),
            );
        },
        IncomingMessage::Typing { timestamp } => {
            registry.broadcast_room_except(
                room_id,
                conn_id,
                SinkEvent::Message(OutgoingMessage::Typing {
                    user_id: conn_id.0,
                    timestamp,
                }),
            );
        },
        IncomingMessage::Ping { timestamp } => {
            sink.try_send(SinkEvent::Message(OutgoingMessage::Pong { timestamp }));
        },
    }
    Ok(())
}

type WsSink = futures::stream::SplitSink<WebSocket, Message>;

async fn writer_task(
    mut ws_tx: WsSink,
    mut rx: mpsc::Receiver<SinkEvent>,
    silently_disconnect: Arc<AtomicBool>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            SinkEvent::Message(frame) => {
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                match tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(Message::Text(text.into())))
                    .await
                {
                    Ok(Ok(())) => {},
                    _ => {
                        let _ = ws_tx.send(close_frame(1002, "write failed")).await;
                        return;
                    },
                }
            },
            SinkEvent::AuthDisconnect => {
                let err = OutgoingMessage::Error {
                    message: "You have been logged out.".to_string(),
                };
                if let Ok(text) = serde_json::to_string(&err) {
                    let _ = ws_tx.send(Message::Text(text.into())).await;
                }
                let _ = ws_tx.send(close_frame(4401, "logged out")).await;
                return;
            },
            SinkEvent::ClientReconnect => {
                silently_disconnect.store(true, Ordering::SeqCst);
                let _ = ws_tx.send(close_frame(4401, "reconnected elsewhere")).await;
                return;
            },
        }
    }
}

fn random_client_id() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..26)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}
