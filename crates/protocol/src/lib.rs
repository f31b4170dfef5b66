//! Wire types and validation rules for the room WebSocket protocol.

pub mod incoming;
pub mod outgoing;
pub mod validation;

pub use incoming::{AuthMessageIncoming, IncomingMessage, PlayerStateData};
pub use outgoing::{ChatMessageWire, OutgoingMessage, RoomInfoWire};

/// System chat messages (join/leave/reconnect/disconnect) carry no author;
/// the wire format serializes that as the nil UUID rather than omitting the field.
pub const SYSTEM_USER_ID: uuid::Uuid = uuid::Uuid::nil();
