//! The codec seam shared by the HCI and 2-wire wire formats.
//!
//! Codecs are marker structs with associated functions rather than trait
//! objects, so [`FrameBuffer`](super::FrameBuffer) and the transport
//! adapters are monomorphised per protocol.

use bytes::{Bytes, BytesMut};

use super::Frame;
use crate::error::{BridgeError, Result};

/// Header layout of one wire protocol.
pub trait FrameCodec: Send + Sync + 'static {
    /// Short protocol name used in log fields.
    const NAME: &'static str;

    /// Peek the header at the start of `buf`.
    ///
    /// Returns `Ok(None)` while the header is incomplete, `Ok(Some(n))` with
    /// the full frame length once it is known, and `MalformedFrame` if a
    /// fixed header field is invalid.
    fn frame_len(buf: &[u8]) -> Result<Option<usize>>;

    /// Decode a frame from a buffer holding exactly one frame.
    ///
    /// Called only after `frame_len` reported `buf.len()`.
    fn decode_exact(buf: &[u8]) -> Result<Frame>;

    /// Append the wire encoding of `frame` to `dst`.
    fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<()>;

    /// Number of bytes to discard after a malformed header.
    fn resync(buf: &[u8]) -> usize {
        usize::from(!buf.is_empty())
    }

    /// Decode one frame from `buf`, which must hold exactly that frame.
    ///
    /// Fails with `MalformedFrame` if the declared length does not match
    /// the number of bytes given, in either direction.
    fn decode(buf: &[u8]) -> Result<Frame> {
        match Self::frame_len(buf)? {
            Some(len) if len == buf.len() => Self::decode_exact(buf),
            Some(len) => Err(BridgeError::malformed(format!(
                "{} frame declares {} bytes but {} were given",
                Self::NAME,
                len,
                buf.len()
            ))),
            None => Err(BridgeError::malformed(format!(
                "{} header truncated at {} bytes",
                Self::NAME,
                buf.len()
            ))),
        }
    }

    /// Encode a frame into a fresh buffer.
    fn encode_to_bytes(frame: &Frame) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(frame.payload_len() + 8);
        Self::encode(frame, &mut dst)?;
        Ok(dst.freeze())
    }
}
