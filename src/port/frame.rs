//! Length-prefixed frame codec for port messages.
//!
//! The wire format is a fixed 4-byte big-endian length header followed by
//! that many payload bytes. Message boundaries never align with socket
//! read boundaries: the decoder accepts input in arbitrary chunks and
//! yields a frame only once the whole payload has arrived, leaving any
//! trailing bytes in the buffer for the next call.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size of the length header on the wire.
pub const HEADER_LEN: usize = 4;

/// Default cap on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Head,
    Data(usize),
}

/// Incremental encoder/decoder for length-prefixed frames.
///
/// One codec instance per connection: decode state (a header read but its
/// payload still in flight) is carried between calls.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_len: usize,
    state: DecodeState,
}

impl FrameCodec {
    /// Creates a codec with the default frame cap.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Creates a codec rejecting frames larger than `max_frame_len`.
    #[must_use]
    pub const fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            state: DecodeState::Head,
        }
    }

    /// Returns the configured frame cap.
    #[must_use]
    pub const fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Appends `payload` to `dst` as one framed message.
    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        if payload.len() > self.max_frame_len {
            return Err(Error::frame_too_large(payload.len(), self.max_frame_len));
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::frame_too_large(payload.len(), self.max_frame_len))?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(len);
        dst.extend_from_slice(payload);
        Ok(())
    }

    /// Extracts the next complete frame from `src`, if one has arrived.
    ///
    /// Consumed bytes are split off the front of `src`; an incomplete
    /// header or payload leaves `src` untouched past what the header
    /// already consumed and returns `Ok(None)`.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                DecodeState::Head => {
                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let len = src.get_u32() as usize;
                    if len > self.max_frame_len {
                        return Err(Error::frame_too_large(len, self.max_frame_len));
                    }
                    self.state = DecodeState::Data(len);
                }
                DecodeState::Data(len) => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let frame = src.split_to(len).freeze();
                    self.state = DecodeState::Head;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
