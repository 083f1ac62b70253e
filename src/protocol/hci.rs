//! HCI UART (H4) framing.
//!
//! ```text
//! command: ┌──────┬────────────┬────────┬────────┐
//!          │ 0x01 │ Opcode     │ Length │ Params │
//!          │      │ uint16 LE  │ uint8  │        │
//!          └──────┴────────────┴────────┴────────┘
//! event:   ┌──────┬────────────┬────────┬────────┐
//!          │ 0x04 │ Event code │ Length │ Params │
//!          │      │ uint8      │ uint8  │        │
//!          └──────┴────────────┴────────┴────────┘
//! ```
//!
//! The opcode packs OCF in the low 10 bits and OGF in the high 6 bits.
//! Command Complete and Command Status events decode as
//! [`FrameKind::Response`]; every other event decodes as
//! [`FrameKind::Event`].

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::FrameCodec;
use super::{Frame, FrameKind};
use crate::error::{BridgeError, Result};

/// Packet indicator of an HCI command.
pub const INDICATOR_COMMAND: u8 = 0x01;

/// Packet indicator of an HCI event.
pub const INDICATOR_EVENT: u8 = 0x04;

/// Command header: indicator, opcode, length.
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Event header: indicator, event code, length.
pub const EVENT_HEADER_SIZE: usize = 3;

/// Largest parameter block an 8-bit length can describe.
pub const MAX_PARAMS: usize = u8::MAX as usize;

/// Command Complete event code.
pub const EVT_COMMAND_COMPLETE: u16 = 0x0E;

/// Command Status event code.
pub const EVT_COMMAND_STATUS: u16 = 0x0F;

/// `Num_HCI_Command_Packets` the bridge advertises in local completions.
pub const NUM_COMMAND_PACKETS: u8 = 0x01;

/// Command opcodes used by the bundled command sets.
pub mod opcodes {
    pub const RESET: u16 = 0x0C03;
    pub const READ_TRANSMIT_POWER_LEVEL: u16 = 0x0C2D;
    pub const READ_RSSI: u16 = 0x1405;
    pub const LE_READ_CHANNEL_MAP: u16 = 0x2015;
    pub const LE_RECEIVER_TEST_V1: u16 = 0x201D;
    pub const LE_TRANSMITTER_TEST_V1: u16 = 0x201E;
    pub const LE_TEST_END: u16 = 0x201F;
    pub const LE_SET_DATA_LENGTH: u16 = 0x2022;
    pub const LE_RECEIVER_TEST_V2: u16 = 0x2033;
    pub const LE_TRANSMITTER_TEST_V2: u16 = 0x2034;
    pub const LE_RECEIVER_TEST_V3: u16 = 0x204F;
    pub const LE_TRANSMITTER_TEST_V3: u16 = 0x2050;

    /// Opcode Command Field (low 10 bits).
    #[inline]
    pub fn ocf(opcode: u16) -> u16 {
        opcode & 0x03FF
    }

    /// Opcode Group Field (high 6 bits).
    #[inline]
    pub fn ogf(opcode: u16) -> u8 {
        (opcode >> 10) as u8
    }
}

/// HCI status codes the bridge produces itself.
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const UNKNOWN_COMMAND: u8 = 0x01;
    pub const COMMAND_DISALLOWED: u8 = 0x0C;
    pub const UNSPECIFIED_ERROR: u8 = 0x1F;
}

/// Build a Command Complete event for `opcode`.
pub fn command_complete(opcode: u16, return_params: &[u8]) -> Frame {
    let mut payload = BytesMut::with_capacity(3 + return_params.len());
    payload.put_u8(NUM_COMMAND_PACKETS);
    payload.put_u16_le(opcode);
    payload.extend_from_slice(return_params);
    Frame::response(EVT_COMMAND_COMPLETE, payload.freeze())
}

/// Fail with `MalformedFrame` if `frame` cannot be written as an H4 packet:
/// more than 255 parameter bytes, or an event code wider than one byte.
pub fn check_encodable(frame: &Frame) -> Result<()> {
    if frame.payload_len() > MAX_PARAMS {
        return Err(BridgeError::malformed(format!(
            "HCI parameters limited to {} bytes, got {}",
            MAX_PARAMS,
            frame.payload_len()
        )));
    }
    if frame.kind() != FrameKind::Command && frame.opcode() > u8::MAX as u16 {
        return Err(BridgeError::malformed(format!(
            "HCI event code 0x{:04X} does not fit in one byte",
            frame.opcode()
        )));
    }
    Ok(())
}

/// HCI H4 codec.
pub struct HciCodec;

impl FrameCodec for HciCodec {
    const NAME: &'static str = "hci";

    fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
        let Some(&indicator) = buf.first() else {
            return Ok(None);
        };
        let (header, len_at) = match indicator {
            INDICATOR_COMMAND => (COMMAND_HEADER_SIZE, 3),
            INDICATOR_EVENT => (EVENT_HEADER_SIZE, 2),
            other => {
                return Err(BridgeError::malformed(format!(
                    "unknown HCI packet indicator 0x{:02X}",
                    other
                )))
            }
        };
        if buf.len() < header {
            return Ok(None);
        }
        Ok(Some(header + buf[len_at] as usize))
    }

    fn decode_exact(buf: &[u8]) -> Result<Frame> {
        match buf[0] {
            INDICATOR_COMMAND => {
                let opcode = u16::from_le_bytes([buf[1], buf[2]]);
                Ok(Frame::command(
                    opcode,
                    Bytes::copy_from_slice(&buf[COMMAND_HEADER_SIZE..]),
                ))
            }
            _ => {
                let code = buf[1] as u16;
                let kind = match code {
                    EVT_COMMAND_COMPLETE | EVT_COMMAND_STATUS => FrameKind::Response,
                    _ => FrameKind::Event,
                };
                Ok(Frame::from_parts(kind, code, &buf[EVENT_HEADER_SIZE..]))
            }
        }
    }

    fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        check_encodable(frame)?;
        let len = frame.payload_len() as u8;

        match frame.kind() {
            FrameKind::Command => {
                dst.reserve(COMMAND_HEADER_SIZE + frame.payload_len());
                dst.put_u8(INDICATOR_COMMAND);
                dst.put_u16_le(frame.opcode());
            }
            FrameKind::Response | FrameKind::Event => {
                dst.reserve(EVENT_HEADER_SIZE + frame.payload_len());
                dst.put_u8(INDICATOR_EVENT);
                dst.put_u8(frame.opcode() as u8);
            }
        }
        dst.put_u8(len);
        dst.extend_from_slice(frame.payload());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reset_command() {
        let frame = HciCodec::decode(&[0x01, 0x03, 0x0C, 0x00]).unwrap();

        assert_eq!(frame.kind(), FrameKind::Command);
        assert_eq!(frame.opcode(), opcodes::RESET);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_opcode_little_endian_with_params() {
        // LE Transmitter Test v1: channel 0x13, length 0x25, payload 0x00
        let bytes = [0x01, 0x1E, 0x20, 0x03, 0x13, 0x25, 0x00];
        let frame = HciCodec::decode(&bytes).unwrap();

        assert_eq!(frame.opcode(), 0x201E);
        assert_eq!(opcodes::ogf(frame.opcode()), 0x08);
        assert_eq!(opcodes::ocf(frame.opcode()), 0x1E);
        assert_eq!(frame.payload(), &[0x13, 0x25, 0x00]);
    }

    #[test]
    fn test_decode_command_complete_as_response() {
        let frame = HciCodec::decode(&[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]).unwrap();

        assert_eq!(frame.kind(), FrameKind::Response);
        assert_eq!(frame.opcode(), EVT_COMMAND_COMPLETE);
        assert_eq!(frame.command_opcode(), Some(opcodes::RESET));
    }

    #[test]
    fn test_decode_other_event() {
        // Disconnection Complete
        let frame = HciCodec::decode(&[0x04, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13]).unwrap();

        assert_eq!(frame.kind(), FrameKind::Event);
        assert_eq!(frame.opcode(), 0x05);
    }

    #[test]
    fn test_encode_command_complete() {
        let frame = command_complete(opcodes::RESET, &[status::SUCCESS]);
        let bytes = HciCodec::encode_to_bytes(&frame).unwrap();

        assert_eq!(&bytes[..], &[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
    }

    #[test]
    fn test_roundtrip() {
        let frames = [
            Frame::from_parts(FrameKind::Command, 0x2034, &[0x00, 0x10, 0x01, 0x02]),
            Frame::from_parts(FrameKind::Response, 0x0F, &[0x00, 0x01, 0x06, 0x04]),
            Frame::from_parts(FrameKind::Event, 0x3E, &[0x0A; 30]),
        ];
        for frame in frames {
            let bytes = HciCodec::encode_to_bytes(&frame).unwrap();
            assert_eq!(HciCodec::decode(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn test_declared_length_longer_than_payload() {
        let result = HciCodec::decode(&[0x01, 0x03, 0x0C, 0x02, 0xAA]);
        assert!(matches!(result, Err(BridgeError::MalformedFrame(_))));
    }

    #[test]
    fn test_declared_length_shorter_than_payload() {
        let result = HciCodec::decode(&[0x04, 0x0E, 0x01, 0x01, 0x03, 0x0C]);
        assert!(matches!(result, Err(BridgeError::MalformedFrame(_))));
    }

    #[test]
    fn test_unknown_indicator() {
        let err = HciCodec::decode(&[0x02, 0x40, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(err.to_string().contains("unknown HCI packet indicator 0x02"));
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(HciCodec::frame_len(&[0x01, 0x03]), Ok(None)));
        assert!(matches!(HciCodec::frame_len(&[]), Ok(None)));
        assert!(HciCodec::decode(&[0x01, 0x03]).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_params() {
        let frame = Frame::from_parts(FrameKind::Command, 0x0C03, &[0u8; 256]);
        assert!(HciCodec::encode_to_bytes(&frame).is_err());
    }

    #[test]
    fn test_encode_rejects_wide_event_code() {
        let frame = Frame::from_parts(FrameKind::Event, 0x0100, &[]);
        assert!(HciCodec::encode_to_bytes(&frame).is_err());
    }

    #[test]
    fn test_check_encodable() {
        assert!(check_encodable(&Frame::from_parts(FrameKind::Command, 0x2050, &[0u8; 255])).is_ok());
        assert!(check_encodable(&Frame::from_parts(FrameKind::Response, 0x0E, &[0u8; 255])).is_ok());
        assert!(matches!(
            check_encodable(&Frame::from_parts(FrameKind::Response, 0x0E, &[0u8; 256])),
            Err(BridgeError::MalformedFrame(_))
        ));
        assert!(matches!(
            check_encodable(&Frame::from_parts(FrameKind::Event, 0x0100, &[0x00])),
            Err(BridgeError::MalformedFrame(_))
        ));
    }
}
