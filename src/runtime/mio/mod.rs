//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS). One
//! thread multiplexes the listener and every connection.

mod event_loop;

pub use event_loop::EventLoop;

use crate::config::Config;
use crate::handler::MessageHandler;
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Serve `listener` on the current thread until `shutdown` is set.
pub fn run(
    listener: TcpListener,
    config: &Config,
    handler: Arc<dyn MessageHandler>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    EventLoop::new(listener, config, handler, shutdown)?.run()
}
