//! Frame codec for the length-prefixed wire format.
//!
//! ```text
//! +----------------+---------------------------+
//! | LEN (u32, LE)  | payload (exactly LEN bytes)|
//! +----------------+---------------------------+
//! ```
//!
//! No magic number, version byte, delimiter or checksum. Framing starts at
//! the first byte of the connection and repeats until it closes.

use crate::error::FrameError;
use bytes::{BufMut, BytesMut};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default maximum payload size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Largest payload the prefix can describe.
pub const MAX_WIRE_LENGTH: usize = u32::MAX as usize;

/// Encode the length prefix for a payload of `len` bytes.
///
/// Fails with `PayloadTooLarge` if `len` exceeds either `max_frame_size`
/// or the width of the prefix.
pub fn encode_header(len: usize, max_frame_size: usize) -> Result<[u8; HEADER_LEN], FrameError> {
    let max = max_frame_size.min(MAX_WIRE_LENGTH);
    if len > max {
        return Err(FrameError::PayloadTooLarge { len, max });
    }
    // Bounded by MAX_WIRE_LENGTH above.
    Ok((len as u32).to_le_bytes())
}

/// Decode a length prefix.
pub fn decode_header(bytes: [u8; HEADER_LEN]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// Encode `payload` as a complete frame.
pub fn encode(payload: &[u8], max_frame_size: usize) -> Result<BytesMut, FrameError> {
    let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_into(payload, max_frame_size, &mut dst)?;
    Ok(dst)
}

/// Append the frame for `payload` to `dst`.
///
/// `dst` is left untouched on error.
pub fn encode_into(
    payload: &[u8],
    max_frame_size: usize,
    dst: &mut BytesMut,
) -> Result<(), FrameError> {
    let header = encode_header(payload.len(), max_frame_size)?;
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_slice(&header);
    dst.put_slice(payload);
    Ok(())
}
