//! Stream reassembly: turns an arbitrarily chunked byte stream into frames.
//!
//! Two entry points share the same buffer logic:
//! - `next_message` blocks until a frame is complete (thread-per-connection
//!   and pool dispatch).
//! - `poll_message` never blocks and reports whether input is exhausted
//!   (readiness-driven dispatch over non-blocking sockets).

use crate::error::FrameError;
use crate::runtime::buffer::RecvBuffer;
use std::io::{self, Read};

/// Result of a non-blocking reassembly step.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll<'a> {
    /// A complete frame's payload.
    Ready(&'a [u8]),
    /// Input was read but does not complete a frame yet; more may be
    /// available without waiting.
    Partial,
    /// No input is available right now.
    WouldBlock,
}

/// Yields complete frames from a byte stream, one at a time.
///
/// Trailing partial frames are retained across calls.
#[derive(Debug)]
pub struct StreamReassembler {
    buffer: RecvBuffer,
}

impl StreamReassembler {
    pub fn new(buffer: RecvBuffer) -> Self {
        Self { buffer }
    }

    /// Release the receive buffer.
    pub fn into_buffer(self) -> RecvBuffer {
        self.buffer
    }

    /// Bytes of an incomplete frame currently buffered.
    pub fn pending(&self) -> usize {
        self.buffer.pending()
    }

    /// Block until the next frame is complete and return its payload.
    ///
    /// A read timeout on `src` surfaces as `ReadTimeout`. End of stream
    /// between frames is `ConnectionClosed`; inside a frame it is
    /// `TruncatedFrame`.
    pub fn next_message<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<&[u8], FrameError> {
        loop {
            if let Some(range) = self.buffer.next_frame_range()? {
                return Ok(self.buffer.slice(range));
            }

            match src.read(self.buffer.read_space()?) {
                Ok(0) => return Err(self.end_of_stream()),
                Ok(n) => self.buffer.commit(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(FrameError::ReadTimeout);
                }
                Err(e) => return Err(FrameError::Io(e)),
            }
        }
    }

    /// Non-blocking form of `next_message`.
    ///
    /// Returns a buffered frame if there is one, otherwise performs at most
    /// one read from `src`, which must be in non-blocking mode.
    pub fn poll_message<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<Poll<'_>, FrameError> {
        if let Some(range) = self.buffer.next_frame_range()? {
            return Ok(Poll::Ready(self.buffer.slice(range)));
        }

        loop {
            match src.read(self.buffer.read_space()?) {
                Ok(0) => return Err(self.end_of_stream()),
                Ok(n) => {
                    self.buffer.commit(n);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Poll::WouldBlock),
                Err(e) => return Err(FrameError::Io(e)),
            }
        }

        match self.buffer.next_frame_range()? {
            Some(range) => Ok(Poll::Ready(self.buffer.slice(range))),
            None => Ok(Poll::Partial),
        }
    }

    fn end_of_stream(&self) -> FrameError {
        if self.buffer.is_empty() {
            FrameError::ConnectionClosed
        } else {
            FrameError::TruncatedFrame {
                pending: self.buffer.pending(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::runtime::transport::mock::{MockTransport, ReadStep};
    use proptest::prelude::*;

    fn reassembler(capacity: usize, max_frame_size: usize) -> StreamReassembler {
        StreamReassembler::new(RecvBuffer::new(capacity, max_frame_size).unwrap())
    }

    fn encode_all(payloads: &[Vec<u8>], max: usize) -> Vec<u8> {
        let mut wire = Vec::new();
        for payload in payloads {
            wire.extend_from_slice(&codec::encode(payload, max).unwrap());
        }
        wire
    }

    fn drain(reasm: &mut StreamReassembler, src: &mut MockTransport) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match reasm.next_message(src) {
                Ok(payload) => out.push(payload.to_vec()),
                Err(FrameError::ConnectionClosed) => return out,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn test_hi_in_two_writes() {
        let mut src = MockTransport::with_chunks([vec![0x02, 0x00, 0x00], vec![0x00, b'h', b'i']]);
        let mut reasm = reassembler(64, 32);

        assert_eq!(reasm.next_message(&mut src).unwrap(), b"hi");
        // Both chunks were needed before the frame was yielded.
        assert!(src.reads.is_empty());
        assert!(matches!(
            reasm.next_message(&mut src),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_two_frames_one_write() {
        let mut wire = codec::encode(b"a", 32).unwrap().to_vec();
        wire.extend_from_slice(&codec::encode(b"bb", 32).unwrap());
        let mut src = MockTransport::with_chunks([wire]);
        let mut reasm = reassembler(64, 32);

        assert_eq!(reasm.next_message(&mut src).unwrap(), b"a");
        assert_eq!(reasm.next_message(&mut src).unwrap(), b"bb");
    }

    #[test]
    fn test_close_inside_header() {
        let mut src = MockTransport::with_chunks([vec![0x02, 0x00]]);
        let mut reasm = reassembler(64, 32);

        match reasm.next_message(&mut src) {
            Err(FrameError::TruncatedFrame { pending: 2 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_read_timeout_and_interrupt() {
        let mut src = MockTransport::default();
        src.reads.push_back(ReadStep::Error(io::ErrorKind::Interrupted));
        src.reads.push_back(ReadStep::Data(vec![1, 0, 0, 0, b'x']));
        src.reads.push_back(ReadStep::Error(io::ErrorKind::WouldBlock));
        let mut reasm = reassembler(64, 32);

        assert_eq!(reasm.next_message(&mut src).unwrap(), b"x");
        assert!(matches!(
            reasm.next_message(&mut src),
            Err(FrameError::ReadTimeout)
        ));
    }

    #[test]
    fn test_oversized_rejected_before_payload() {
        // Header announces 100 bytes; no payload follows.
        let mut src = MockTransport::with_chunks([vec![100, 0, 0, 0]]);
        src.reads.push_back(ReadStep::Error(io::ErrorKind::TimedOut));
        let mut reasm = reassembler(64, 32);

        match reasm.next_message(&mut src) {
            Err(FrameError::FrameTooLarge { len: 100, max: 32 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_compaction_is_transparent() {
        // Buffer fits exactly one maximum frame, so a long stream forces
        // repeated compaction with a partial frame in flight.
        let payloads: Vec<Vec<u8>> = (0..50u8)
            .map(|i| (0..(i % 9)).map(|j| i.wrapping_mul(31) ^ j).collect())
            .collect();
        let wire = encode_all(&payloads, 8);
        let chunks: Vec<Vec<u8>> = wire.chunks(7).map(|c| c.to_vec()).collect();
        let mut src = MockTransport::with_chunks(chunks);
        let mut reasm = reassembler(12, 8);

        assert_eq!(drain(&mut reasm, &mut src), payloads);
    }

    #[test]
    fn test_poll_message_states() {
        let mut src = MockTransport::default();
        src.reads.push_back(ReadStep::Data(vec![2, 0, 0]));
        src.reads.push_back(ReadStep::Error(io::ErrorKind::WouldBlock));
        src.reads.push_back(ReadStep::Data(vec![0, b'o', b'k', 1, 0, 0, 0, b'!']));
        let mut reasm = reassembler(64, 32);

        assert_eq!(reasm.poll_message(&mut src).unwrap(), Poll::Partial);
        assert_eq!(reasm.poll_message(&mut src).unwrap(), Poll::WouldBlock);
        assert_eq!(reasm.poll_message(&mut src).unwrap(), Poll::Ready(b"ok"));
        // Second frame is already buffered; no read needed.
        assert_eq!(reasm.poll_message(&mut src).unwrap(), Poll::Ready(b"!"));
        assert!(matches!(
            reasm.poll_message(&mut src),
            Err(FrameError::ConnectionClosed)
        ));
    }

    proptest! {
        #[test]
        fn test_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..=256)) {
            let wire = codec::encode(&payload, 256).unwrap().to_vec();
            let mut src = MockTransport::with_chunks([wire]);
            let mut reasm = reassembler(260, 256);
            prop_assert_eq!(reasm.next_message(&mut src).unwrap(), &payload[..]);
        }

        #[test]
        fn test_chunking_invariance(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..=64), 1..12),
            chunk in 1usize..40,
        ) {
            let wire = encode_all(&payloads, 64);

            let mut whole = MockTransport::with_chunks([wire.clone()]);
            let mut split = MockTransport::with_chunks(wire.chunks(chunk).map(|c| c.to_vec()));

            let expected = drain(&mut reassembler(68, 64), &mut whole);
            let actual = drain(&mut reassembler(68, 64), &mut split);
            prop_assert_eq!(&expected, &payloads);
            prop_assert_eq!(actual, expected);
        }
    }
}
