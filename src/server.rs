//! TCP server for framed message connections.
//!
//! `Server::bind` does every fallible setup step up front (validation,
//! socket creation, bind, listen) so configuration and address errors surface
//! before any connection is accepted. `Server::run` then blocks serving with
//! the configured dispatch strategy until a `ShutdownHandle` stops it.

use crate::config::{Config, DispatchMode};
use crate::error::ServerError;
use crate::handler::MessageHandler;
use crate::runtime::{self, ShutdownHandle};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A bound server, ready to run.
pub struct Server {
    config: Config,
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl Server {
    /// Validate `config` and bind its listen address.
    pub fn bind(config: Config, handler: Arc<dyn MessageHandler>) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.socket_addr()?;

        let listener =
            runtime::create_listener(addr, config.backlog).map_err(|source| ServerError::Listen {
                addr: config.listen.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            dispatch = ?config.dispatch,
            max_connections = config.max_connections,
            max_frame_size = config.max_frame_size,
            "Server listening"
        );

        Ok(Server {
            config,
            listener,
            handler,
            shutdown: Arc::new(AtomicBool::new(false)),
            local_addr,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops `run` from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(Arc::clone(&self.shutdown), self.local_addr)
    }

    /// Serve until shut down. Connection failures never end the server; only
    /// a failure of the accept or event loop itself is returned.
    pub fn run(self) -> Result<(), ServerError> {
        runtime::run(self.listener, &self.config, self.handler, self.shutdown)?;
        info!(addr = %self.local_addr, "Server stopped");
        Ok(())
    }
}

/// Bind `bind_address` and serve forever on a worker pool.
///
/// Returns only on a fatal setup or accept-loop error.
pub fn start(
    bind_address: &str,
    max_connections: usize,
    max_frame_size: usize,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), ServerError> {
    let config = Config {
        listen: bind_address.to_string(),
        dispatch: DispatchMode::Pool,
        max_connections,
        max_frame_size,
        buffer_size: max_frame_size.saturating_add(crate::codec::HEADER_LEN),
        read_timeout,
        write_timeout,
        ..Config::default()
    };
    Server::bind(config, handler)?.run()
}
