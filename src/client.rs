//! Blocking framed client.
//!
//! Uses the same reliable writer and stream reassembler as the server, so a
//! client and a server built from this crate agree on framing by
//! construction.

use crate::codec::{DEFAULT_MAX_FRAME_SIZE, HEADER_LEN};
use crate::error::FrameError;
use crate::runtime::buffer::RecvBuffer;
use crate::runtime::reassembler::StreamReassembler;
use crate::runtime::writer;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// A framed connection to a server.
pub struct Client {
    stream: TcpStream,
    reassembler: StreamReassembler,
    max_frame_size: usize,
    write_timeout: Option<Duration>,
}

impl Client {
    /// Connect with the default frame limit and the given deadlines.
    pub fn connect(
        addr: SocketAddr,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Result<Self, FrameError> {
        Self::connect_with_limit(addr, DEFAULT_MAX_FRAME_SIZE, read_timeout, write_timeout)
    }

    /// Connect, accepting frames up to `max_frame_size` bytes.
    pub fn connect_with_limit(
        addr: SocketAddr,
        max_frame_size: usize,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Result<Self, FrameError> {
        let stream = match write_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_nodelay(true)?;
        stream.set_read_timeout(read_timeout)?;

        let buffer = RecvBuffer::new(max_frame_size.saturating_add(HEADER_LEN), max_frame_size)?;
        Ok(Self {
            stream,
            reassembler: StreamReassembler::new(buffer),
            max_frame_size,
            write_timeout,
        })
    }

    /// Send one framed message.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        writer::write_message(
            &mut self.stream,
            payload,
            self.max_frame_size,
            self.write_timeout,
        )
    }

    /// Receive the next framed message.
    pub fn recv(&mut self) -> Result<Vec<u8>, FrameError> {
        self.reassembler
            .next_message(&mut self.stream)
            .map(<[u8]>::to_vec)
    }

    /// Send a message and wait for one reply.
    pub fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        self.send(payload)?;
        self.recv()
    }

    /// The underlying socket, for raw writes and half-closes.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}
