//! Length-prefixed frame codec for the RPC endpoints.
//!
//! Each frame is a 4-byte big-endian length followed by one protobuf
//! message. The length is validated before any allocation, and frames above
//! [`MAX_FRAME_SIZE`] are rejected, so a hostile peer cannot make the
//! gateway allocate unbounded memory from a forged prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::RpcError;

/// Length of the frame header (4 bytes for the u32 length prefix).
const HEADER_LEN: usize = 4;

/// Maximum payload size accepted on the wire (4 MiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Length-prefixed binary framing for use with
/// [`tokio_util::codec::Framed`].
#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, RpcError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validate the length before reserving anything.
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(RpcError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), RpcError> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(RpcError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
