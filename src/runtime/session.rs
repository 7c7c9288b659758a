//! Blocking connection session.
//!
//! Binds a stream reassembler and the reliable writer to one accepted
//! connection and drives the receive loop:
//!
//! ```text
//! Accepted --apply deadlines--> Active --EOF / error--> Draining --> Closed
//! ```
//!
//! The transport is released exactly once, on every exit path, when the
//! session reaches `Closed` (or is dropped).

use crate::error::FrameError;
use crate::handler::{ConnectionId, MessageHandler};
use crate::runtime::reassembler::StreamReassembler;
use crate::runtime::transport::Transport;
use crate::runtime::writer;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection obtained, deadlines not yet applied.
    Accepted,
    /// Receive loop running.
    Active,
    /// Receive loop finished; no further I/O.
    Draining,
    /// Transport released.
    Closed,
}

/// Per-connection framing limits and deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_frame_size: usize,
    pub buffer_size: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// One connection served by a dedicated execution context.
pub struct Session<T: Transport> {
    id: ConnectionId,
    transport: Option<T>,
    reassembler: StreamReassembler,
    limits: SessionLimits,
    state: SessionState,
}

impl<T: Transport> Session<T> {
    /// Create a session in the `Accepted` state.
    ///
    /// The caller allocates the reassembler's buffer; the session owns it
    /// from here on.
    pub fn new(
        id: ConnectionId,
        transport: T,
        reassembler: StreamReassembler,
        limits: SessionLimits,
    ) -> Self {
        Self {
            id,
            transport: Some(transport),
            reassembler,
            limits,
            state: SessionState::Accepted,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the connection until it closes or fails, then close it.
    ///
    /// A peer closing between frames is a normal end and returns `Ok`.
    pub fn run(&mut self, handler: &dyn MessageHandler) -> Result<(), FrameError> {
        let result = self.activate().and_then(|()| self.serve(handler));
        self.state = SessionState::Draining;
        self.close();

        match result {
            Err(FrameError::ConnectionClosed) => {
                debug!(conn_id = self.id, "Peer closed connection");
                Ok(())
            }
            Err(e) if e.is_protocol_violation() => {
                warn!(conn_id = self.id, error = %e, "Protocol violation, connection closed");
                Err(e)
            }
            Err(e) => {
                debug!(conn_id = self.id, error = %e, "Connection error");
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Release the transport. Idempotent.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            drop(transport);
            trace!(conn_id = self.id, "Transport released");
        }
        self.state = SessionState::Closed;
    }

    fn activate(&mut self) -> Result<(), FrameError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(FrameError::ConnectionClosed)?;
        transport.set_read_timeout(self.limits.read_timeout)?;
        transport.set_write_timeout(self.limits.write_timeout)?;
        self.state = SessionState::Active;
        Ok(())
    }

    fn serve(&mut self, handler: &dyn MessageHandler) -> Result<(), FrameError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(FrameError::ConnectionClosed)?;

        loop {
            let payload = self.reassembler.next_message(&mut *transport)?;
            trace!(conn_id = self.id, len = payload.len(), "Frame received");

            if let Some(reply) = handler.handle(self.id, payload) {
                writer::write_message(
                    &mut *transport,
                    &reply,
                    self.limits.max_frame_size,
                    self.limits.write_timeout,
                )?;
            }
        }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::handler::{Discard, Echo};
    use crate::runtime::buffer::RecvBuffer;
    use crate::runtime::transport::mock::{MockTransport, ReadStep};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const LIMITS: SessionLimits = SessionLimits {
        max_frame_size: 64,
        buffer_size: 68,
        read_timeout: Some(Duration::from_secs(3)),
        write_timeout: Some(Duration::from_secs(2)),
    };

    fn session(transport: MockTransport) -> Session<MockTransport> {
        let buffer = RecvBuffer::new(LIMITS.buffer_size, LIMITS.max_frame_size).unwrap();
        Session::new(9, transport, StreamReassembler::new(buffer), LIMITS)
    }

    /// Transport whose writes are observable after the session drops it.
    struct Shared {
        inner: MockTransport,
        written: Arc<std::sync::Mutex<Vec<u8>>>,
        dropped: Arc<AtomicUsize>,
    }

    impl io::Read for Shared {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            io::Read::read(&mut self.inner, buf)
        }
    }

    impl io::Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Shared {
        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.set_read_timeout(timeout)
        }

        fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.inner.set_write_timeout(timeout)
        }
    }

    impl Drop for Shared {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn shared(chunks: Vec<Vec<u8>>) -> (Shared, Arc<std::sync::Mutex<Vec<u8>>>, Arc<AtomicUsize>) {
        let written = Arc::new(std::sync::Mutex::new(Vec::new()));
        let dropped = Arc::new(AtomicUsize::new(0));
        let transport = Shared {
            inner: MockTransport::with_chunks(chunks),
            written: Arc::clone(&written),
            dropped: Arc::clone(&dropped),
        };
        (transport, written, dropped)
    }

    #[test]
    fn test_echo_session_until_peer_close() {
        let mut wire = codec::encode(b"a", 64).unwrap().to_vec();
        wire.extend_from_slice(&codec::encode(b"bb", 64).unwrap());
        let (transport, written, dropped) = shared(vec![wire.clone()]);

        let buffer = RecvBuffer::new(LIMITS.buffer_size, LIMITS.max_frame_size).unwrap();
        let mut session = Session::new(1, transport, StreamReassembler::new(buffer), LIMITS);
        assert_eq!(session.state(), SessionState::Accepted);

        session.run(&Echo).unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(*written.lock().unwrap(), wire);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        // Closing again and dropping do not release twice.
        session.close();
        drop(session);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deadlines_applied_on_activation() {
        let mut session = session(MockTransport::default());
        let transport = session.transport.as_ref().unwrap();
        assert!(transport.read_timeouts.borrow().is_empty());

        session.activate().unwrap();
        assert_eq!(session.state(), SessionState::Active);
        let transport = session.transport.as_ref().unwrap();
        assert_eq!(*transport.read_timeouts.borrow(), vec![LIMITS.read_timeout]);
        assert_eq!(*transport.write_timeouts.borrow(), vec![LIMITS.write_timeout]);
    }

    #[test]
    fn test_timeout_tears_down() {
        let mut transport = MockTransport::default();
        transport.reads.push_back(ReadStep::Error(io::ErrorKind::TimedOut));
        let mut session = session(transport);

        assert!(matches!(session.run(&Discard), Err(FrameError::ReadTimeout)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.transport.is_none());
    }

    #[test]
    fn test_oversized_frame_closes_without_reply() {
        let (transport, written, dropped) = shared(vec![vec![0xff, 0, 0, 0]]);
        let buffer = RecvBuffer::new(LIMITS.buffer_size, LIMITS.max_frame_size).unwrap();
        let mut session = Session::new(2, transport, StreamReassembler::new(buffer), LIMITS);

        assert!(matches!(
            session.run(&Echo),
            Err(FrameError::FrameTooLarge { len: 255, max: 64 })
        ));
        assert!(written.lock().unwrap().is_empty());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oversized_reply_fails_session() {
        let wire = codec::encode(b"grow", 64).unwrap().to_vec();
        let (transport, written, _dropped) = shared(vec![wire]);
        let buffer = RecvBuffer::new(LIMITS.buffer_size, LIMITS.max_frame_size).unwrap();
        let mut session = Session::new(3, transport, StreamReassembler::new(buffer), LIMITS);

        let inflate = |_conn: ConnectionId, _payload: &[u8]| Some(vec![0u8; 65]);
        assert!(matches!(
            session.run(&inflate),
            Err(FrameError::PayloadTooLarge { len: 65, .. })
        ));
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handler_sees_connection_id() {
        let wire = codec::encode(b"x", 64).unwrap().to_vec();
        let mut session = session(MockTransport::with_chunks([wire]));
        let seen = AtomicUsize::new(0);
        let record = |conn: ConnectionId, _payload: &[u8]| {
            seen.store(conn as usize, Ordering::SeqCst);
            None::<Vec<u8>>
        };
        session.run(&record).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 9);
        assert_eq!(session.id(), 9);
    }
}
