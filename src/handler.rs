//! Application message handlers.
//!
//! The server delivers each frame's payload as opaque bytes; a handler may
//! return a reply payload, which is framed and written back on the same
//! connection.

use clap::ValueEnum;
use serde::Deserialize;
use std::sync::Arc;

/// Identifies a connection for the lifetime of the server.
pub type ConnectionId = u64;

/// Processes one payload and optionally produces a reply.
///
/// Called from worker threads (blocking dispatch) or from the event loop
/// thread (readiness dispatch). In the event loop a slow handler stalls every
/// connection, so handlers must not block.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, conn: ConnectionId, payload: &[u8]) -> Option<Vec<u8>>;
}

impl<F> MessageHandler for F
where
    F: Fn(ConnectionId, &[u8]) -> Option<Vec<u8>> + Send + Sync,
{
    fn handle(&self, conn: ConnectionId, payload: &[u8]) -> Option<Vec<u8>> {
        self(conn, payload)
    }
}

/// Replies with the received payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl MessageHandler for Echo {
    fn handle(&self, _conn: ConnectionId, payload: &[u8]) -> Option<Vec<u8>> {
        Some(payload.to_vec())
    }
}

/// Accepts payloads without replying.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl MessageHandler for Discard {
    fn handle(&self, _conn: ConnectionId, _payload: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Built-in handler selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerType {
    #[default]
    Echo,
    Discard,
}

impl HandlerType {
    pub fn build(self) -> Arc<dyn MessageHandler> {
        match self {
            HandlerType::Echo => Arc::new(Echo),
            HandlerType::Discard => Arc::new(Discard),
        }
    }
}
