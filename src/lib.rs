//! framed-server: length-prefixed message framing over TCP.
//!
//! Every message travels as a 4-byte little-endian length followed by the
//! payload. The crate provides:
//! - The frame codec and a reliable, deadline-bounded writer
//! - A stream reassembler that recovers whole frames from arbitrary chunking
//! - Connection sessions with explicit lifecycle and guaranteed release
//! - Three dispatch strategies: supervised thread per connection, a bounded
//!   worker pool, and a mio readiness loop
//! - Configuration via CLI arguments or TOML file

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod runtime;
pub mod server;

pub use client::Client;
pub use config::{Config, DispatchMode};
pub use error::{FrameError, ServerError};
pub use handler::{ConnectionId, MessageHandler};
pub use runtime::ShutdownHandle;
pub use server::{start, Server};
