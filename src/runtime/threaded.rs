//! Blocking accept loop for the thread-per-connection and worker-pool
//! strategies.
//!
//! The loop owns the listener and hands every accepted connection to an
//! `Executor`, which runs a `Session` on some thread. Backpressure comes from
//! the executor: a full supervisor or a full pool queue blocks `execute`, and
//! with it the accept loop.

use crate::config::{Config, DispatchMode};
use crate::handler::{ConnectionId, MessageHandler};
use crate::runtime::buffer::RecvBuffer;
use crate::runtime::pool::WorkerPool;
use crate::runtime::reassembler::StreamReassembler;
use crate::runtime::session::{Session, SessionLimits};
use crate::runtime::supervisor::Supervisor;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where accepted connections run.
pub enum Executor {
    /// One supervised thread per connection.
    PerConnection(Supervisor),
    /// A fixed set of workers fed through a bounded queue.
    Pool(WorkerPool),
}

impl Executor {
    /// Build the executor for a blocking dispatch mode.
    ///
    /// Returns `None` for modes that do not use a blocking accept loop.
    pub fn for_config(config: &Config) -> io::Result<Option<Self>> {
        let executor = match config.dispatch {
            DispatchMode::Thread => Executor::PerConnection(Supervisor::new(config.max_connections)),
            DispatchMode::Pool => Executor::Pool(WorkerPool::new(
                config.max_connections,
                config.pending_connections,
            )?),
            DispatchMode::EventLoop => return Ok(None),
        };
        Ok(Some(executor))
    }

    fn execute<F>(&mut self, job: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Executor::PerConnection(supervisor) => supervisor.spawn(job),
            Executor::Pool(pool) => pool
                .submit(Box::new(job))
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e)),
        }
    }

    /// Wait for every running and queued session to finish.
    fn drain(&mut self) {
        match self {
            Executor::PerConnection(supervisor) => supervisor.shutdown(),
            Executor::Pool(pool) => pool.shutdown(),
        }
    }
}

/// Accept connections until `shutdown` is set, then drain the executor.
pub fn run(
    listener: TcpListener,
    mut executor: Executor,
    limits: SessionLimits,
    handler: Arc<dyn MessageHandler>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut next_id: ConnectionId = 0;
    info!("Accept loop started");

    for incoming in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Accept error");
                continue;
            }
        };

        let id = next_id;
        next_id += 1;
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn_id = id, error = %e, "Failed to set TCP_NODELAY");
        }

        let handler = Arc::clone(&handler);
        let job = move || serve(id, stream, peer, limits, &*handler);
        if let Err(e) = executor.execute(job) {
            // The stream moved into the job and was dropped with it.
            error!(conn_id = id, error = %e, "Failed to dispatch connection");
        }
    }

    info!("Accept loop stopping, draining connections");
    executor.drain();
    Ok(())
}

/// Run one session to completion on the calling thread.
fn serve(
    id: ConnectionId,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    limits: SessionLimits,
    handler: &dyn MessageHandler,
) {
    let buffer = match RecvBuffer::new(limits.buffer_size, limits.max_frame_size) {
        Ok(buffer) => buffer,
        Err(e) => {
            warn!(conn_id = id, error = %e, "Cannot allocate receive buffer");
            return;
        }
    };

    match peer {
        Some(peer) => debug!(conn_id = id, peer = %peer, "Accepted connection"),
        None => debug!(conn_id = id, "Accepted connection"),
    }

    let mut session = Session::new(id, stream, StreamReassembler::new(buffer), limits);
    // Errors are logged by the session at the level they deserve.
    let _ = session.run(handler);
    debug!(conn_id = id, "Connection closed");
}
