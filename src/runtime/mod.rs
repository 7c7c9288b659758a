//! Networking runtime.
//!
//! Two families of dispatch share the same framing core:
//! - Blocking (`threaded`): an accept loop hands each connection to a
//!   `Session`, run on its own supervised thread or on a worker pool.
//! - Readiness (`mio`): one event loop multiplexes every connection with
//!   non-blocking sockets.
//!
//! Shared pieces:
//! - `RecvBuffer` / `BufferPool`: receive buffer management
//! - `StreamReassembler`: frames out of an arbitrary byte stream
//! - `writer`: reliable framed writes under a deadline

pub mod buffer;
pub mod connection;
pub mod mio;
pub mod pool;
pub mod reassembler;
pub mod session;
pub mod supervisor;
pub mod threaded;
pub mod transport;
pub mod writer;

use crate::config::{Config, DispatchMode};
use crate::handler::MessageHandler;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Create a TCP listener with `SO_REUSEADDR` and the given backlog.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Stops a running server from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl ShutdownHandle {
    pub(crate) fn new(flag: Arc<AtomicBool>, addr: SocketAddr) -> Self {
        Self { flag, addr }
    }

    /// Stop accepting and let the server drain.
    ///
    /// Blocking accept loops are woken by a throwaway connection to the
    /// listener.
    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::AcqRel) {
            return;
        }
        let target = wake_address(self.addr);
        match TcpStream::connect_timeout(&target, Duration::from_secs(1)) {
            Ok(_) => debug!(addr = %target, "Accept loop woken for shutdown"),
            Err(e) => debug!(addr = %target, error = %e, "Shutdown wake-up connect failed"),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// An unspecified bind address is reachable through loopback.
fn wake_address(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Serve `listener` with the configured dispatch strategy until shutdown.
pub fn run(
    listener: TcpListener,
    config: &Config,
    handler: Arc<dyn MessageHandler>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    match config.dispatch {
        DispatchMode::EventLoop => mio::run(listener, config, handler, shutdown),
        DispatchMode::Thread | DispatchMode::Pool => {
            let Some(executor) = threaded::Executor::for_config(config)? else {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "dispatch mode has no blocking executor",
                ));
            };
            threaded::run(listener, executor, config.session_limits(), handler, shutdown)
        }
    }
}
