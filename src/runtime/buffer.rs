//! Receive buffers for frame reassembly.
//!
//! `RecvBuffer` is a fixed-capacity byte region with two cursors:
//!
//! ```text
//! 0          consumed            filled             capacity
//! |-----------|===================|------------------|
//!   delivered    undelivered bytes     free space
//! ```
//!
//! The invariant `0 <= consumed <= filled <= capacity` holds at all times.
//! The buffer never grows. When the frame in progress would not fit between
//! `consumed` and the end of the buffer, the undelivered bytes are moved to
//! offset 0 (compaction). Compaction is lazy: steady small-frame traffic
//! only ever resets the cursors when the buffer drains completely.
//!
//! `BufferPool` recycles the backing storage between connections so a
//! long-running event loop does not allocate per accept.

use crate::codec::{self, HEADER_LEN};
use crate::error::FrameError;
use std::ops::Range;

/// Receive buffer owned by exactly one connection.
#[derive(Debug)]
pub struct RecvBuffer {
    buf: Vec<u8>,
    filled: usize,
    consumed: usize,
    max_frame_size: usize,
}

impl RecvBuffer {
    /// Allocate a buffer of `capacity` bytes.
    ///
    /// Fails if a maximum-sized frame plus its header would not fit.
    pub fn new(capacity: usize, max_frame_size: usize) -> Result<Self, FrameError> {
        Self::from_storage(vec![0u8; capacity], max_frame_size)
    }

    /// Wrap existing storage. The full length of `storage` is the capacity.
    pub fn from_storage(storage: Vec<u8>, max_frame_size: usize) -> Result<Self, FrameError> {
        let capacity = storage.len();
        if HEADER_LEN.saturating_add(max_frame_size) > capacity {
            return Err(FrameError::InsufficientBufferCapacity {
                capacity,
                max_frame_size,
            });
        }
        Ok(Self {
            buf: storage,
            filled: 0,
            consumed: 0,
            max_frame_size,
        })
    }

    /// Release the backing storage.
    pub fn into_storage(self) -> Vec<u8> {
        self.buf
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes received but not yet delivered as part of a frame.
    pub fn pending(&self) -> usize {
        self.filled - self.consumed
    }

    /// True when no undelivered bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.filled == self.consumed
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// Returns the payload, not including the length prefix.
    pub fn next_frame(&mut self) -> Result<Option<&[u8]>, FrameError> {
        let range = self.next_frame_range()?;
        Ok(range.map(|range| &self.buf[range]))
    }

    /// Like `next_frame`, but returns the payload's position in the buffer.
    ///
    /// The range stays valid until the next call that mutates the buffer.
    pub(crate) fn next_frame_range(&mut self) -> Result<Option<Range<usize>>, FrameError> {
        let len = match self.declared_len()? {
            Some(len) => len,
            None => return Ok(None),
        };
        if self.pending() < HEADER_LEN + len {
            return Ok(None);
        }

        let start = self.consumed + HEADER_LEN;
        self.consumed = start + len;
        if self.consumed == self.filled {
            // Drained: rewind for free instead of compacting later.
            self.consumed = 0;
            self.filled = 0;
        }
        Ok(Some(start..start + len))
    }

    /// Payload bytes for a range returned by `next_frame_range`.
    pub(crate) fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// Free space to read into, compacting first if the frame in progress
    /// would not fit.
    ///
    /// Always returns a non-empty slice; call `commit` with the number of
    /// bytes written into it.
    pub fn read_space(&mut self) -> Result<&mut [u8], FrameError> {
        let needed = match self.declared_len()? {
            Some(len) => HEADER_LEN + len,
            None => HEADER_LEN,
        };

        if self.consumed + needed > self.capacity() {
            self.compact();
        }
        if self.filled == self.capacity() {
            // Only reachable if the capacity check in the constructor was bypassed.
            return Err(FrameError::FrameTooLarge {
                len: needed.saturating_sub(HEADER_LEN),
                max: self.capacity().saturating_sub(HEADER_LEN),
            });
        }
        Ok(&mut self.buf[self.filled..])
    }

    /// Record `n` bytes written into the slice from `read_space`.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.capacity(), "commit past capacity");
        self.filled = (self.filled + n).min(self.capacity());
    }

    /// Move undelivered bytes to the start of the buffer.
    pub fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }
        self.buf.copy_within(self.consumed..self.filled, 0);
        self.filled -= self.consumed;
        self.consumed = 0;
    }

    /// Declared payload length of the frame in progress, once its header is
    /// fully buffered.
    fn declared_len(&self) -> Result<Option<usize>, FrameError> {
        if self.pending() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[self.consumed..self.consumed + HEADER_LEN]);
        let len = codec::decode_header(header) as usize;
        if len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        Ok(Some(len))
    }

    #[cfg(test)]
    pub(crate) fn cursors(&self) -> (usize, usize) {
        (self.consumed, self.filled)
    }
}

/// Recycles receive buffer storage.
///
/// Storage is allocated on demand up to `limit` outstanding buffers and
/// reused after it is checked back in.
pub struct BufferPool {
    /// Storage ready for reuse (LIFO for cache locality).
    free_list: Vec<Vec<u8>>,
    /// Size of each buffer.
    buffer_size: usize,
    /// Buffers currently checked out.
    outstanding: usize,
    /// Maximum buffers checked out at once.
    limit: usize,
}

impl BufferPool {
    /// Create an empty pool handing out buffers of `buffer_size` bytes.
    pub fn new(limit: usize, buffer_size: usize) -> Self {
        Self {
            free_list: Vec::new(),
            buffer_size,
            outstanding: 0,
            limit,
        }
    }

    /// Check out a buffer.
    ///
    /// Returns `None` if `limit` buffers are already checked out.
    pub fn checkout(&mut self) -> Option<Vec<u8>> {
        if self.outstanding >= self.limit {
            return None;
        }
        self.outstanding += 1;
        Some(
            self.free_list
                .pop()
                .unwrap_or_else(|| vec![0u8; self.buffer_size]),
        )
    }

    /// Return a buffer to the pool.
    pub fn checkin(&mut self, storage: Vec<u8>) {
        debug_assert!(self.outstanding > 0, "checkin without checkout");
        self.outstanding = self.outstanding.saturating_sub(1);
        if storage.len() == self.buffer_size {
            self.free_list.push(storage);
        }
    }

    /// Get the size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Buffers that could still be checked out.
    pub fn available(&self) -> usize {
        self.limit - self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buf: &mut RecvBuffer, bytes: &[u8]) {
        let mut offset = 0;
        while offset < bytes.len() {
            let space = buf.read_space().unwrap();
            let n = space.len().min(bytes.len() - offset);
            space[..n].copy_from_slice(&bytes[offset..offset + n]);
            buf.commit(n);
            offset += n;
        }
    }

    #[test]
    fn test_rejects_undersized_buffer() {
        match RecvBuffer::new(10, 8) {
            Err(FrameError::InsufficientBufferCapacity {
                capacity: 10,
                max_frame_size: 8,
            }) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(RecvBuffer::new(12, 8).is_ok());
    }

    #[test]
    fn test_split_header() {
        let mut buf = RecvBuffer::new(64, 32).unwrap();
        feed(&mut buf, &[0x02, 0x00, 0x00]);
        assert!(buf.next_frame().unwrap().is_none());

        feed(&mut buf, &[0x00, b'h', b'i']);
        assert_eq!(buf.next_frame().unwrap(), Some(&b"hi"[..]));
        assert!(buf.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = RecvBuffer::new(64, 32).unwrap();
        feed(&mut buf, &[1, 0, 0, 0, b'a', 2, 0, 0, 0, b'b', b'b']);

        assert_eq!(buf.next_frame().unwrap(), Some(&b"a"[..]));
        assert_eq!(buf.next_frame().unwrap(), Some(&b"bb"[..]));
        assert!(buf.next_frame().unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rewind_when_drained() {
        let mut buf = RecvBuffer::new(64, 32).unwrap();
        feed(&mut buf, &[1, 0, 0, 0, b'x']);
        assert_eq!(buf.next_frame().unwrap(), Some(&b"x"[..]));
        assert_eq!(buf.cursors(), (0, 0));
    }

    #[test]
    fn test_compaction_preserves_partial_frame() {
        // Capacity 12 holds exactly one 8-byte frame plus header.
        let mut buf = RecvBuffer::new(12, 8).unwrap();

        // Full 2-byte frame followed by 5 bytes of an 8-byte frame.
        feed(&mut buf, &[2, 0, 0, 0, b'o', b'k', 8, 0, 0, 0, b'1']);
        assert_eq!(buf.next_frame().unwrap(), Some(&b"ok"[..]));
        assert_eq!(buf.cursors(), (6, 11));

        // The 8-byte frame cannot fit from offset 6; read_space compacts.
        let space_len = buf.read_space().unwrap().len();
        assert_eq!(buf.cursors(), (0, 5));
        assert_eq!(space_len, 7);

        feed(&mut buf, b"2345678");
        assert_eq!(buf.next_frame().unwrap(), Some(&b"12345678"[..]));
    }

    #[test]
    fn test_compaction_with_partial_header() {
        let mut buf = RecvBuffer::new(8, 4).unwrap();
        feed(&mut buf, &[1, 0, 0, 0, b'z', 3, 0]);
        assert_eq!(buf.next_frame().unwrap(), Some(&b"z"[..]));
        assert_eq!(buf.cursors(), (5, 7));

        // Only one byte left at the tail; the header needs two more.
        buf.read_space().unwrap();
        assert_eq!(buf.cursors(), (0, 2));

        feed(&mut buf, &[0, 0, b'a', b'b', b'c']);
        assert_eq!(buf.next_frame().unwrap(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_no_compaction_when_frame_fits() {
        let mut buf = RecvBuffer::new(64, 32).unwrap();
        feed(&mut buf, &[1, 0, 0, 0, b'a', 2, 0]);
        buf.next_frame().unwrap();
        buf.read_space().unwrap();
        assert_eq!(buf.cursors(), (5, 7));
    }

    #[test]
    fn test_frame_too_large_on_header() {
        let mut buf = RecvBuffer::new(64, 16).unwrap();
        feed(&mut buf, &[17, 0, 0, 0]);
        match buf.next_frame() {
            Err(FrameError::FrameTooLarge { len: 17, max: 16 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            buf.read_space(),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut buf = RecvBuffer::new(16, 8).unwrap();
        feed(&mut buf, &[0, 0, 0, 0]);
        assert_eq!(buf.next_frame().unwrap(), Some(&b""[..]));
    }

    #[test]
    fn test_buffer_pool_checkout_limit() {
        let mut pool = BufferPool::new(2, 128);
        assert_eq!(pool.buffer_size(), 128);

        let b0 = pool.checkout().unwrap();
        let b1 = pool.checkout().unwrap();
        assert_eq!(b0.len(), 128);
        assert!(pool.checkout().is_none());
        assert_eq!(pool.available(), 0);

        pool.checkin(b1);
        assert_eq!(pool.outstanding(), 1);
        let b2 = pool.checkout().unwrap();
        assert_eq!(b2.len(), 128);

        pool.checkin(b0);
        pool.checkin(b2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_buffer_pool_reuses_storage() {
        let mut pool = BufferPool::new(1, 64);
        let storage = pool.checkout().unwrap();
        let ptr = storage.as_ptr();

        let mut recv = RecvBuffer::from_storage(storage, 32).unwrap();
        feed(&mut recv, &[1, 0, 0, 0, b'q']);
        pool.checkin(recv.into_storage());

        let again = pool.checkout().unwrap();
        assert_eq!(again.as_ptr(), ptr);
    }
}
