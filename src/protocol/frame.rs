//! Protocol-neutral frame shared by both codecs.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use hci_bridge::protocol::{Frame, FrameKind};
//! use bytes::Bytes;
//!
//! let frame = Frame::command(0x0C03, Bytes::new());
//! assert_eq!(frame.kind(), FrameKind::Command);
//! assert_eq!(frame.opcode(), 0x0C03);
//! ```

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;

use super::hci::{EVT_COMMAND_COMPLETE, EVT_COMMAND_STATUS};

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// A command toward the IUT.
    Command,
    /// The answer to a command.
    Response,
    /// Anything the IUT emits on its own.
    Event,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => f.write_str("command"),
            Self::Response => f.write_str("response"),
            Self::Event => f.write_str("event"),
        }
    }
}

/// A complete protocol message.
///
/// Frames are values: transformations build new frames instead of
/// mutating the payload in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    opcode: u16,
    payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, opcode: u16, payload: Bytes) -> Self {
        Self {
            kind,
            opcode,
            payload,
        }
    }

    /// Create a command frame.
    pub fn command(opcode: u16, payload: Bytes) -> Self {
        Self::new(FrameKind::Command, opcode, payload)
    }

    /// Create a response frame.
    pub fn response(opcode: u16, payload: Bytes) -> Self {
        Self::new(FrameKind::Response, opcode, payload)
    }

    /// Create an event frame.
    pub fn event(opcode: u16, payload: Bytes) -> Self {
        Self::new(FrameKind::Event, opcode, payload)
    }

    /// Create a frame from raw bytes (copies data).
    pub fn from_parts(kind: FrameKind, opcode: u16, payload: &[u8]) -> Self {
        Self::new(kind, opcode, Bytes::copy_from_slice(payload))
    }

    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Opcode of a command, or event code of an HCI event.
    #[inline]
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_command(&self) -> bool {
        self.kind == FrameKind::Command
    }

    /// Same kind and opcode, different payload.
    pub fn with_payload(&self, payload: Bytes) -> Self {
        Self::new(self.kind, self.opcode, payload)
    }

    /// Opcode of the command an HCI Command Complete/Status event answers.
    ///
    /// Command Complete: `num_packets, opcode LE, return params...`.
    /// Command Status: `status, num_packets, opcode LE`.
    pub fn command_opcode(&self) -> Option<u16> {
        if self.kind == FrameKind::Command {
            return None;
        }
        let at = match self.opcode {
            EVT_COMMAND_COMPLETE => 1,
            EVT_COMMAND_STATUS => 2,
            _ => return None,
        };
        let bytes = self.payload.get(at..at + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Return parameters of an HCI Command Complete event.
    pub fn return_params(&self) -> Option<&[u8]> {
        if self.kind == FrameKind::Command || self.opcode != EVT_COMMAND_COMPLETE {
            return None;
        }
        self.payload.get(3..)
    }

    /// Offset of the status byte inside the payload, if the frame has one.
    pub fn status_offset(&self) -> Option<usize> {
        match (self.kind, self.opcode) {
            (FrameKind::Command, _) => None,
            (_, EVT_COMMAND_COMPLETE) => Some(3),
            _ => Some(0),
        }
    }

    /// Opcode interception rules are matched against.
    pub fn match_opcode(&self) -> u16 {
        self.command_opcode().unwrap_or(self.opcode)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} 0x{:04X} [", self.kind, self.opcode)?;
        for byte in self.payload.iter() {
            write!(f, "{:02x}", byte)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::from_parts(FrameKind::Command, 0x201E, &[0x13, 0x25, 0x00]);

        assert_eq!(frame.kind(), FrameKind::Command);
        assert_eq!(frame.opcode(), 0x201E);
        assert_eq!(frame.payload(), &[0x13, 0x25, 0x00]);
        assert_eq!(frame.payload_len(), 3);
        assert!(frame.is_command());
    }

    #[test]
    fn test_command_opcode_from_command_complete() {
        let frame = Frame::response(EVT_COMMAND_COMPLETE, Bytes::from_static(&[0x01, 0x03, 0x0C, 0x00]));
        assert_eq!(frame.command_opcode(), Some(0x0C03));
        assert_eq!(frame.return_params(), Some(&[0x00][..]));
        assert_eq!(frame.status_offset(), Some(3));
        assert_eq!(frame.match_opcode(), 0x0C03);
    }

    #[test]
    fn test_command_opcode_from_command_status() {
        let frame = Frame::response(EVT_COMMAND_STATUS, Bytes::from_static(&[0x00, 0x01, 0x06, 0x04]));
        assert_eq!(frame.command_opcode(), Some(0x0406));
        assert_eq!(frame.return_params(), None);
        assert_eq!(frame.status_offset(), Some(0));
    }

    #[test]
    fn test_short_command_complete_has_no_opcode() {
        let frame = Frame::response(EVT_COMMAND_COMPLETE, Bytes::from_static(&[0x01, 0x03]));
        assert_eq!(frame.command_opcode(), None);
        assert_eq!(frame.match_opcode(), EVT_COMMAND_COMPLETE);
    }

    #[test]
    fn test_plain_event_matches_on_code() {
        let frame = Frame::event(0x3E, Bytes::from_static(&[0x01, 0x00]));
        assert_eq!(frame.command_opcode(), None);
        assert_eq!(frame.match_opcode(), 0x3E);
        assert_eq!(frame.status_offset(), Some(0));
    }

    #[test]
    fn test_commands_carry_no_status() {
        let frame = Frame::command(0x0C03, Bytes::new());
        assert_eq!(frame.status_offset(), None);
        assert_eq!(frame.command_opcode(), None);
    }

    #[test]
    fn test_with_payload_keeps_header() {
        let original = Frame::event(0x05, Bytes::from_static(b"\x00\x40\x00\x13"));
        let changed = original.with_payload(Bytes::from_static(b"\x01"));

        assert_eq!(changed.kind(), original.kind());
        assert_eq!(changed.opcode(), original.opcode());
        assert_eq!(changed.payload(), b"\x01");
        assert_eq!(original.payload(), b"\x00\x40\x00\x13");
    }

    #[test]
    fn test_display_hex() {
        let frame = Frame::from_parts(FrameKind::Response, 0x0E, &[0x01, 0x03, 0x0C, 0x00]);
        assert_eq!(frame.to_string(), "response 0x000E [01030c00]");
    }
}
