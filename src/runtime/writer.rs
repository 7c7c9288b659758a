//! Reliable frame writer.
//!
//! Sends `header ++ payload` with scatter-gather writes, resuming after
//! partial writes until every byte has been accepted by the transport.

use crate::codec;
use crate::error::FrameError;
use crate::runtime::transport::Transport;
use std::io::{self, IoSlice};
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

/// Consecutive zero-byte writes tolerated before giving up.
const MAX_ZERO_WRITES: usize = 16;

/// Header and payload spans still to be written.
///
/// Spans are consumed from the front; the remaining length only shrinks.
#[derive(Debug)]
pub struct PendingWrite<'a> {
    spans: [&'a [u8]; 2],
    front: usize,
}

impl<'a> PendingWrite<'a> {
    pub fn new(header: &'a [u8], payload: &'a [u8]) -> Self {
        let mut pending = Self {
            spans: [header, payload],
            front: 0,
        };
        pending.skip_empty();
        pending
    }

    /// Bytes not yet written.
    pub fn remaining(&self) -> usize {
        self.spans[self.front.min(2)..].iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.front >= self.spans.len()
    }

    /// Slices for the next vectored write.
    pub fn io_slices(&self) -> Vec<IoSlice<'a>> {
        self.spans[self.front.min(2)..]
            .iter()
            .map(|span| IoSlice::new(*span))
            .collect()
    }

    /// Consume `n` written bytes from the front spans.
    pub fn advance(&mut self, mut n: usize) {
        debug_assert!(n <= self.remaining(), "advanced past pending data");
        while n > 0 && !self.is_empty() {
            let span = self.spans[self.front];
            if n >= span.len() {
                n -= span.len();
                self.spans[self.front] = &[];
                self.front += 1;
            } else {
                self.spans[self.front] = &span[n..];
                n = 0;
            }
        }
        self.skip_empty();
    }

    fn skip_empty(&mut self) {
        while !self.is_empty() && self.spans[self.front].is_empty() {
            self.front += 1;
        }
    }
}

/// Write one frame carrying `payload` to `conn`.
///
/// Returns only after the whole frame is accepted, or with an error. On
/// error the frame may be partially sent and the connection must be closed.
/// `timeout` bounds the total time spent in this call.
pub fn write_message<T: Transport + ?Sized>(
    conn: &mut T,
    payload: &[u8],
    max_frame_size: usize,
    timeout: Option<Duration>,
) -> Result<(), FrameError> {
    let header = codec::encode_header(payload.len(), max_frame_size)?;
    let mut pending = PendingWrite::new(&header, payload);
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut zero_writes = 0;

    while !pending.is_empty() {
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FrameError::WriteTimeout);
            }
            conn.set_write_timeout(Some(remaining))?;
        }

        match conn.write_vectored(&pending.io_slices()) {
            // Nothing accepted and no error: try again, but not forever.
            Ok(0) => {
                zero_writes += 1;
                if zero_writes > MAX_ZERO_WRITES {
                    return Err(FrameError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport repeatedly accepted no bytes",
                    )));
                }
                thread::yield_now();
            }
            Ok(n) => {
                zero_writes = 0;
                trace!(
                    written = n,
                    remaining = pending.remaining().saturating_sub(n),
                    "Frame write progress"
                );
                pending.advance(n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(FrameError::WriteTimeout);
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }

    conn.flush()?;
    Ok(())
}
