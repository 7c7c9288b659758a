//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS.
//!
//! Sockets are registered edge-triggered for both directions once, at accept.
//! Because an edge is reported only once, a connection that stops reading
//! before the socket would block (budget spent, or paused by backpressure) is
//! put on a backlog and re-driven without waiting for another event.

use crate::config::Config;
use crate::error::FrameError;
use crate::handler::{ConnectionId, MessageHandler};
use crate::runtime::buffer::{BufferPool, RecvBuffer};
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry, ReadOutcome};
use crate::runtime::reassembler::StreamReassembler;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Upper bound on how long a poll blocks, so the shutdown flag and the
/// deadline sweep are checked regularly.
const TICK: Duration = Duration::from_millis(100);

/// Single-threaded readiness loop serving every connection.
pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    connections: ConnectionRegistry<TcpStream>,
    buffers: BufferPool,
    handler: Arc<dyn MessageHandler>,
    shutdown: Arc<AtomicBool>,
    /// Connections with input that may still be buffered in the kernel.
    backlog: VecDeque<usize>,
    /// False while the registry is full; pending connections wait in the
    /// listen backlog.
    accepting: bool,
    next_id: ConnectionId,
    max_frame_size: usize,
    read_budget: usize,
    event_capacity: usize,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    last_sweep: Instant,
}

impl EventLoop {
    /// Take over a bound, non-blocking listener.
    pub fn new(
        listener: std::net::TcpListener,
        config: &Config,
        handler: Arc<dyn MessageHandler>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections: ConnectionRegistry::new(config.max_connections),
            buffers: BufferPool::new(config.max_connections, config.buffer_size),
            handler,
            shutdown,
            backlog: VecDeque::new(),
            accepting: true,
            next_id: 0,
            max_frame_size: config.max_frame_size,
            read_budget: config.read_budget,
            event_capacity: config.event_capacity,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            last_sweep: Instant::now(),
        })
    }

    /// Serve until the shutdown flag is set, then close every connection.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.event_capacity);
        info!(
            max_connections = self.buffers.available(),
            read_budget = self.read_budget,
            "Event loop started"
        );

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = if self.backlog.is_empty() {
                TICK
            } else {
                Duration::ZERO
            };

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept(),
                    Token(key) => {
                        let readable = event.is_readable() || event.is_read_closed();
                        self.service(key, readable, event.is_writable());
                    }
                }
            }

            self.drive_backlog();

            if !self.accepting && !self.connections.is_full() {
                debug!("Connection slot freed, resuming accept");
                self.accepting = true;
                self.accept();
            }

            if self.last_sweep.elapsed() >= TICK {
                self.sweep(Instant::now());
            }
        }

        self.close_all();
        Ok(())
    }

    fn accept(&mut self) {
        while self.accepting {
            let Some(key) = self.connections.vacant_key() else {
                debug!("Connection limit reached, pausing accept");
                self.accepting = false;
                break;
            };

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    self.register(key, stream, peer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn register(&mut self, key: usize, mut stream: TcpStream, peer: std::net::SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let Some(storage) = self.buffers.checkout() else {
            warn!(peer = %peer, "Buffer pool exhausted, rejecting connection");
            return;
        };
        let buffer = match RecvBuffer::from_storage(storage, self.max_frame_size) {
            Ok(buffer) => buffer,
            Err(e) => {
                // Release the pool slot; the storage itself was consumed.
                self.buffers.checkin(Vec::new());
                error!(error = %e, "Receive buffer rejected");
                return;
            }
        };

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.buffers.checkin(buffer.into_storage());
            error!(peer = %peer, error = %e, "Failed to register connection");
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        // Replies beyond one receive buffer's worth pause reading.
        let outbound_limit = buffer.capacity();
        let conn = Connection::new(id, stream, StreamReassembler::new(buffer), outbound_limit);

        match self.connections.insert(conn) {
            Some(inserted) => {
                debug_assert_eq!(inserted, key);
                debug!(conn_id = id, peer = %peer, "Accepted connection");
            }
            None => warn!(peer = %peer, "Connection registry full, dropping connection"),
        }
    }

    fn service(&mut self, key: usize, readable: bool, writable: bool) {
        let result = self
            .on_readable(key, readable)
            .and_then(|()| self.on_writable(key, writable));
        if let Err(e) = result {
            self.close(key, e);
        }
    }

    fn on_readable(&mut self, key: usize, readable: bool) -> Result<(), FrameError> {
        if !readable {
            return Ok(());
        }
        let Some(conn) = self.connections.get_mut(key) else {
            return Ok(());
        };
        if conn.state != ConnState::Active {
            return Ok(());
        }

        let outcome = conn.on_readable(&*self.handler, self.read_budget, self.max_frame_size)?;
        let flushed = conn.flush()?;
        trace!(conn_id = conn.id, ?outcome, queued = conn.queued(), "Read serviced");

        match outcome {
            ReadOutcome::Drained => {}
            ReadOutcome::BudgetExhausted => self.backlog.push_back(key),
            ReadOutcome::Backpressured => {
                if flushed && conn.take_read_paused() {
                    self.backlog.push_back(key);
                }
            }
            ReadOutcome::PeerClosed => {
                if flushed {
                    return Err(FrameError::ConnectionClosed);
                }
                debug!(conn_id = conn.id, queued = conn.queued(), "Peer closed, draining replies");
            }
        }
        Ok(())
    }

    fn on_writable(&mut self, key: usize, writable: bool) -> Result<(), FrameError> {
        if !writable {
            return Ok(());
        }
        let Some(conn) = self.connections.get_mut(key) else {
            return Ok(());
        };
        if !conn.flush()? {
            return Ok(());
        }

        match conn.state {
            ConnState::Draining => Err(FrameError::ConnectionClosed),
            ConnState::Active => {
                if conn.take_read_paused() {
                    self.backlog.push_back(key);
                }
                Ok(())
            }
        }
    }

    /// Continue reading connections that stopped short of `WouldBlock`.
    fn drive_backlog(&mut self) {
        let pending = std::mem::take(&mut self.backlog);
        for key in pending {
            if let Err(e) = self.on_readable(key, true) {
                self.close(key, e);
            }
        }
    }

    /// Close connections idle past the read deadline, or whose replies have
    /// not drained within the write deadline.
    fn sweep(&mut self, now: Instant) {
        self.last_sweep = now;

        let expired: Vec<(usize, FrameError)> = self
            .connections
            .iter()
            .filter_map(|(key, conn)| {
                let stalled = conn
                    .write_pending_since()
                    .zip(self.write_timeout)
                    .is_some_and(|(since, limit)| now.duration_since(since) > limit);
                if stalled {
                    return Some((key, FrameError::WriteTimeout));
                }

                let idle = conn.state == ConnState::Active
                    && conn.queued() == 0
                    && self
                        .read_timeout
                        .is_some_and(|limit| now.duration_since(conn.last_read()) > limit);
                idle.then_some((key, FrameError::ReadTimeout))
            })
            .collect();

        for (key, reason) in expired {
            self.close(key, reason);
        }
    }

    fn close(&mut self, key: usize, reason: FrameError) {
        let Some(conn) = self.connections.remove(key) else {
            return;
        };
        let id = conn.id;
        let (mut stream, reassembler) = conn.into_parts();
        let _ = self.poll.registry().deregister(&mut stream);
        self.buffers
            .checkin(reassembler.into_buffer().into_storage());

        if reason.is_graceful() {
            debug!(conn_id = id, "Connection closed");
        } else if reason.is_protocol_violation() {
            warn!(conn_id = id, error = %reason, "Protocol violation, connection closed");
        } else {
            debug!(conn_id = id, error = %reason, "Connection error");
        }
    }

    fn close_all(&mut self) {
        let open = self.connections.keys();
        info!(connections = open.len(), "Event loop stopping");
        for key in open {
            self.close(key, FrameError::ConnectionClosed);
        }
    }
}
