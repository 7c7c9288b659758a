//! Error types for framing, sessions and server setup.
//!
//! `FrameError` covers everything that can end a single connection.
//! `ServerError` covers the few failures that are fatal to the whole server.

use crate::config::ConfigError;
use std::io;

/// Errors local to one connection.
///
/// Any of these tears down the connection that produced it; the server keeps
/// accepting new connections.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Peer closed the connection between frames.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Peer closed the connection in the middle of a frame.
    #[error("connection closed with {pending} bytes of an incomplete frame buffered")]
    TruncatedFrame {
        /// Bytes of the unfinished frame that were received.
        pending: usize,
    },

    /// No data arrived within the read deadline.
    #[error("read deadline exceeded")]
    ReadTimeout,

    /// The frame could not be flushed within the write deadline.
    #[error("write deadline exceeded")]
    WriteTimeout,

    /// An incoming frame declared a length above the configured maximum.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared payload length.
        len: usize,
        /// Configured maximum frame size.
        max: usize,
    },

    /// An outgoing payload cannot be framed.
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Effective maximum (configured limit or the prefix width).
        max: usize,
    },

    /// The receive buffer cannot hold a maximum-sized frame.
    #[error("buffer capacity {capacity} cannot hold a {max_frame_size}-byte frame and its header")]
    InsufficientBufferCapacity {
        /// Receive buffer capacity in bytes.
        capacity: usize,
        /// Configured maximum frame size.
        max_frame_size: usize,
    },

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True for the expected end of a connection (peer closed between frames).
    pub fn is_graceful(&self) -> bool {
        matches!(self, FrameError::ConnectionClosed)
    }

    /// True for errors caused by the peer violating the framing rules.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::FrameTooLarge { .. }
                | FrameError::PayloadTooLarge { .. }
                | FrameError::TruncatedFrame { .. }
        )
    }
}

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration rejected at startup.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Listener could not be created, bound or put into listening state.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        /// Address the server tried to bind.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The dispatch loop itself failed.
    #[error("dispatch loop failed: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(FrameError::ConnectionClosed.is_graceful());
        assert!(!FrameError::ReadTimeout.is_graceful());
        assert!(FrameError::FrameTooLarge { len: 10, max: 5 }.is_protocol_violation());
        assert!(FrameError::TruncatedFrame { pending: 2 }.is_protocol_violation());
        assert!(!FrameError::WriteTimeout.is_protocol_violation());
    }

    #[test]
    fn test_error_display() {
        let err = FrameError::FrameTooLarge { len: 2048, max: 1024 };
        assert_eq!(err.to_string(), "frame too large: 2048 bytes (max 1024)");

        let err: FrameError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, FrameError::Io(_)));
    }
}
