//! Length-prefixed framing for request/reply payloads.
//!
//! ```text
//! ┌───────────────────────┬──────────────────────────────┐
//! │ Length (4, big-endian)│ Payload (Length bytes)       │
//! └───────────────────────┴──────────────────────────────┘
//! ```
//!
//! TCP is a byte stream, so the receiving side accumulates bytes in a
//! [`FrameDecoder`] until a whole frame is available.

use thiserror::Error;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload either side accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Framing violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Payload length exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLong { len: usize, max: usize },
}

/// Appends one frame carrying `payload` to `buf`.
///
/// Unlike a reset-and-write encoder, existing bytes in `buf` are kept: the
/// socket may still hold unsent data when the next frame is queued.
///
/// # Errors
///
/// Returns [`FrameError::TooLong`] if the payload is larger than [`MAX_FRAME_LEN`].
pub fn encode_frame(payload: &[u8], buf: &mut Vec<u8>) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLong {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    // Bounded by MAX_FRAME_LEN above.
    let len = payload.len() as u32;
    buf.reserve(HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Reassembles frames from a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as frames.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLong`] as soon as a header announces an
    /// oversized payload; the stream cannot be resynchronised after that.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLong {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(payload))
    }
}
