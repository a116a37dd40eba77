//! Stream framing
//!
//! Byte-stream transports (TCP, Unix sockets) carry each encoded message as a
//! frame:
//!
//! ```text
//! ┌──────────────┬───────────────┬─────────────────┐
//! │ sync word    │ length        │ payload         │
//! │ B8 23 A0 6F  │ u32 LE        │ `length` bytes  │
//! └──────────────┴───────────────┴─────────────────┘
//! ```
//!
//! The decoder scans for the sync word, so a reader that joins mid-stream or
//! hits garbage resynchronizes on the next frame boundary instead of failing
//! the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::{ProtocolError, Result};

/// Frame boundary marker
pub const SYNC_WORD: [u8; 4] = [0xB8, 0x23, 0xA0, 0x6F];

/// Sync word plus length prefix
pub const FRAME_HEADER_SIZE: usize = SYNC_WORD.len() + 4;

/// Largest payload accepted by default (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wrap `payload` in a frame
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_slice(&SYNC_WORD);
    buf.put_u32_le(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental frame decoder over a growing read buffer
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Extract the next complete frame payload from `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes preceding a sync
    /// word are discarded. An oversized frame consumes its header and returns
    /// [`ProtocolError::FrameTooLarge`]; the next call resumes scanning.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        self.skip_to_sync(buf);
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if len > self.max_frame_size {
            buf.advance(FRAME_HEADER_SIZE);
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        if buf.len() < FRAME_HEADER_SIZE + len {
            buf.reserve(FRAME_HEADER_SIZE + len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        Ok(Some(buf.split_to(len).freeze()))
    }

    fn skip_to_sync(&self, buf: &mut BytesMut) {
        if buf.starts_with(&SYNC_WORD) {
            return;
        }

        let position = buf
            .windows(SYNC_WORD.len())
            .position(|window| window == SYNC_WORD);

        // Keep a partial sync word at the tail for the next read
        let discard = match position {
            Some(position) => position,
            None => buf.len() - partial_sync_suffix(buf),
        };

        if discard > 0 {
            warn!(discarded = discard, "Discarding bytes while resynchronizing stream");
            buf.advance(discard);
        }
    }
}

fn partial_sync_suffix(buf: &[u8]) -> usize {
    (1..SYNC_WORD.len())
        .rev()
        .find(|&n| buf.len() >= n && buf[buf.len() - n..] == SYNC_WORD[..n])
        .unwrap_or(0)
}
