//! 2-wire framing used toward the IUT.
//!
//! Implements the 6-byte header format:
//! ```text
//! ┌──────┬───────┬───────────┬───────────┬─────────┐
//! │ Sync │ Kind  │ Opcode    │ Length    │ Payload │
//! │ 0xA5 │ 1 byte│ uint16 BE │ uint16 BE │         │
//! └──────┴───────┴───────────┴───────────┴─────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::FrameCodec;
use super::{Frame, FrameKind};
use crate::error::{BridgeError, Result};

/// Header size in bytes (fixed, exactly 6).
pub const HEADER_SIZE: usize = 6;

/// Synchronisation byte opening every frame.
pub const SYNC: u8 = 0xA5;

/// Largest payload the 16-bit length can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Kind byte values.
pub mod kinds {
    pub const COMMAND: u8 = 0x01;
    pub const RESPONSE: u8 = 0x02;
    pub const EVENT: u8 = 0x03;
}

fn kind_from_byte(byte: u8) -> Result<FrameKind> {
    match byte {
        kinds::COMMAND => Ok(FrameKind::Command),
        kinds::RESPONSE => Ok(FrameKind::Response),
        kinds::EVENT => Ok(FrameKind::Event),
        other => Err(BridgeError::malformed(format!(
            "unknown 2-wire frame kind 0x{:02X}",
            other
        ))),
    }
}

fn kind_to_byte(kind: FrameKind) -> u8 {
    match kind {
        FrameKind::Command => kinds::COMMAND,
        FrameKind::Response => kinds::RESPONSE,
        FrameKind::Event => kinds::EVENT,
    }
}

/// 2-wire codec.
pub struct TwoWireCodec;

impl FrameCodec for TwoWireCodec {
    const NAME: &'static str = "2-wire";

    fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
        let Some(&sync) = buf.first() else {
            return Ok(None);
        };
        if sync != SYNC {
            return Err(BridgeError::malformed(format!(
                "expected 2-wire sync byte 0x{:02X}, got 0x{:02X}",
                SYNC, sync
            )));
        }
        if let Some(&kind) = buf.get(1) {
            kind_from_byte(kind)?;
        }
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        Ok(Some(HEADER_SIZE + length))
    }

    fn decode_exact(buf: &[u8]) -> Result<Frame> {
        let kind = kind_from_byte(buf[1])?;
        let opcode = u16::from_be_bytes([buf[2], buf[3]]);
        Ok(Frame::new(
            kind,
            opcode,
            Bytes::copy_from_slice(&buf[HEADER_SIZE..]),
        ))
    }

    fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        let length = u16::try_from(frame.payload_len()).map_err(|_| {
            BridgeError::malformed(format!(
                "2-wire payload limited to {} bytes, got {}",
                MAX_PAYLOAD,
                frame.payload_len()
            ))
        })?;
        dst.reserve(HEADER_SIZE + frame.payload_len());
        dst.put_u8(SYNC);
        dst.put_u8(kind_to_byte(frame.kind()));
        dst.put_u16(frame.opcode());
        dst.put_u16(length);
        dst.extend_from_slice(frame.payload());
        Ok(())
    }

    /// Skip to the next sync byte after the current position.
    fn resync(buf: &[u8]) -> usize {
        buf.iter()
            .skip(1)
            .position(|&b| b == SYNC)
            .map_or(buf.len(), |pos| pos + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_big_endian_byte_order() {
        let frame = Frame::from_parts(FrameKind::Command, 0x0102, &[0xAA; 0x0304]);
        let bytes = TwoWireCodec::encode_to_bytes(&frame).unwrap();

        assert_eq!(bytes[0], SYNC);
        assert_eq!(bytes[1], kinds::COMMAND);
        // Opcode: 0x0102 in BE
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x02);
        // Length: 0x0304 in BE
        assert_eq!(bytes[4], 0x03);
        assert_eq!(bytes[5], 0x04);
        assert_eq!(bytes.len(), HEADER_SIZE + 0x0304);
    }

    #[test]
    fn test_roundtrip_each_kind() {
        for kind in [FrameKind::Command, FrameKind::Response, FrameKind::Event] {
            let frame = Frame::from_parts(kind, 0x201F, &[0x80, 0x2A]);
            let bytes = TwoWireCodec::encode_to_bytes(&frame).unwrap();
            assert_eq!(TwoWireCodec::decode(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn test_empty_payload() {
        let bytes = [SYNC, kinds::RESPONSE, 0x0C, 0x03, 0x00, 0x00];
        let frame = TwoWireCodec::decode(&bytes).unwrap();

        assert_eq!(frame.kind(), FrameKind::Response);
        assert_eq!(frame.opcode(), 0x0C03);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_missing_sync_rejected() {
        let err = TwoWireCodec::decode(&[0x00, kinds::COMMAND, 0, 0, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("sync byte"));
    }

    #[test]
    fn test_unknown_kind_rejected_before_full_header() {
        let result = TwoWireCodec::frame_len(&[SYNC, 0x09]);
        assert!(matches!(result, Err(BridgeError::MalformedFrame(_))));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let long = [SYNC, kinds::EVENT, 0x00, 0x3E, 0x00, 0x03, 0x01];
        assert!(matches!(
            TwoWireCodec::decode(&long),
            Err(BridgeError::MalformedFrame(_))
        ));

        let trailing = [SYNC, kinds::EVENT, 0x00, 0x3E, 0x00, 0x00, 0x01];
        assert!(matches!(
            TwoWireCodec::decode(&trailing),
            Err(BridgeError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_resync_to_next_sync_byte() {
        assert_eq!(TwoWireCodec::resync(&[0x00, 0x11, SYNC, 0x01]), 2);
        assert_eq!(TwoWireCodec::resync(&[SYNC, 0x09, SYNC]), 2);
        assert_eq!(TwoWireCodec::resync(&[0x00, 0x11]), 2);
    }
}
