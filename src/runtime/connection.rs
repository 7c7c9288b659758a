//! Connection state for the readiness-driven event loop.
//!
//! Each connection owns its non-blocking stream, a stream reassembler and an
//! outbound queue of encoded reply frames. Nothing here blocks: reads stop at
//! `WouldBlock` or when the per-event budget runs out, writes stop at
//! `WouldBlock` and resume on the next writable event.

use crate::codec;
use crate::error::FrameError;
use crate::handler::{ConnectionId, MessageHandler};
use crate::runtime::reassembler::{Poll, StreamReassembler};
use bytes::{Buf, BytesMut};
use slab::Slab;
use std::io::{self, Read, Write};
use std::time::Instant;
use tracing::trace;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading frames and queueing replies.
    Active,
    /// Peer closed its side; flushing queued replies before closing.
    Draining,
}

/// Outcome of servicing a readable connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Socket drained until it would block.
    Drained,
    /// Read budget spent with input possibly still pending.
    BudgetExhausted,
    /// Outbound queue is over its limit; reading paused until it drains.
    Backpressured,
    /// Peer closed its side between frames.
    PeerClosed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    pub id: ConnectionId,
    pub stream: S,
    pub state: ConnState,
    reassembler: StreamReassembler,
    outbound: BytesMut,
    outbound_limit: usize,
    /// Last time bytes were received.
    last_read: Instant,
    /// When writes last stopped making progress with replies still queued.
    write_pending_since: Option<Instant>,
    /// Reading was paused by backpressure.
    read_paused: bool,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in the active state.
    ///
    /// Reading pauses once `outbound_limit` bytes of replies are queued.
    pub fn new(
        id: ConnectionId,
        stream: S,
        reassembler: StreamReassembler,
        outbound_limit: usize,
    ) -> Self {
        Self {
            id,
            stream,
            state: ConnState::Active,
            reassembler,
            outbound: BytesMut::new(),
            outbound_limit,
            last_read: Instant::now(),
            write_pending_since: None,
            read_paused: false,
        }
    }

    /// Read and dispatch frames until the socket would block, the budget
    /// runs out or the outbound queue is full.
    ///
    /// Each reassembler step (one read, or one buffered frame) costs one unit
    /// of `budget`. Replies are queued, not written.
    pub fn on_readable(
        &mut self,
        handler: &dyn MessageHandler,
        budget: usize,
        max_frame_size: usize,
    ) -> Result<ReadOutcome, FrameError> {
        let Self {
            id,
            stream,
            reassembler,
            outbound,
            ..
        } = self;

        for _ in 0..budget {
            if outbound.len() >= self.outbound_limit {
                self.read_paused = true;
                return Ok(ReadOutcome::Backpressured);
            }

            match reassembler.poll_message(&mut *stream) {
                Ok(Poll::Ready(payload)) => {
                    self.last_read = Instant::now();
                    trace!(conn_id = *id, len = payload.len(), "Frame received");
                    if let Some(reply) = handler.handle(*id, payload) {
                        codec::encode_into(&reply, max_frame_size, outbound)?;
                    }
                }
                Ok(Poll::Partial) => self.last_read = Instant::now(),
                Ok(Poll::WouldBlock) => return Ok(ReadOutcome::Drained),
                Err(FrameError::ConnectionClosed) => {
                    self.state = ConnState::Draining;
                    return Ok(ReadOutcome::PeerClosed);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::BudgetExhausted)
    }

    /// Write queued replies until done or the socket would block.
    ///
    /// Returns `true` when the queue is empty.
    pub fn flush(&mut self) -> Result<bool, FrameError> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(FrameError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(n) => {
                    self.outbound.advance(n);
                    // Progress restarts the stall clock.
                    self.write_pending_since = None;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.write_pending_since.get_or_insert_with(Instant::now);
                    return Ok(false);
                }
                Err(e) => return Err(FrameError::Io(e)),
            }
        }
        self.write_pending_since = None;
        Ok(true)
    }

    /// Bytes of encoded replies waiting to be written.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// True if reading was paused by backpressure; clears the flag.
    pub fn take_read_paused(&mut self) -> bool {
        std::mem::take(&mut self.read_paused)
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }

    pub fn write_pending_since(&self) -> Option<Instant> {
        self.write_pending_since
    }

    /// Tear down the connection, returning its reassembler for buffer reuse.
    pub fn into_parts(self) -> (S, StreamReassembler) {
        (self.stream, self.reassembler)
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Slots freed by
/// closed connections are reused by later accepts.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Reserve the slot the next insert will use.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn vacant_key(&self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.vacant_key())
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, key: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(key)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, key: usize) -> Option<Connection<S>> {
        self.connections.try_remove(key)
    }

    /// Check if a connection exists.
    pub fn contains(&self, key: usize) -> bool {
        self.connections.contains(key)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Keys of all connections.
    pub fn keys(&self) -> Vec<usize> {
        self.connections.iter().map(|(key, _)| key).collect()
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection<S>)> {
        self.connections.iter()
    }
}
