//! Gateway: HTTP surface, WebSocket session lifecycle, connection registry,
//! and the background reaper, all wired together in [`server`].
//!
//! Persistence lives behind `watchroom_db::PersistenceGateway`; wire types
//! and validation live in `watchroom_protocol`; this crate only owns the
//! in-memory runtime state (who is connected to which room) and the
//! request/response glue around it.

pub mod auth;
pub mod http;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod session;
