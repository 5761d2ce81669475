//! Length-prefixed framing over a byte stream.
//!
//! Frames may arrive split across reads or several to a read; the decoder
//! keeps partial input in the `BytesMut` buffer owned by `FramedRead` and
//! only yields once a whole body is present.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{CodecError, Frame, parse_body, write_body};

/// Size of the little-endian `u32` prefix in front of every body.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest body accepted by default (64 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Streaming codec for use with `FramedRead` / `FramedWrite`.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    #[must_use]
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let declared = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let len = usize::try_from(declared).unwrap_or(usize::MAX);
        if len > self.max_frame_length {
            return Err(CodecError::FrameTooLarge { len, max: self.max_frame_length });
        }

        let total = LENGTH_PREFIX_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let body = src.split_to(len).freeze();
        parse_body(body).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = frame.encoded_len();
        if len > self.max_frame_length {
            return Err(CodecError::FrameTooLarge { len, max: self.max_frame_length });
        }
        let prefix = u32::try_from(len).map_err(|_| CodecError::FrameTooLarge { len, max: self.max_frame_length })?;

        dst.reserve(LENGTH_PREFIX_LEN + len);
        dst.put_u32_le(prefix);
        write_body(&frame, dst);
        Ok(())
    }
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod tests;
