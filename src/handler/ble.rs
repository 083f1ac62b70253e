//! HCI pass-through command set.
//!
//! The IUT understands HCI itself; the 2-wire frame only replaces the H4
//! framing. Commands keep their opcode and parameters. The IUT answers
//! with either a 2-wire response (opcode + return parameters, turned into
//! a Command Complete) or a 2-wire event carrying a raw HCI event.

use crate::correlation::CorrelationKey;
use crate::error::{BridgeError, Result};
use crate::protocol::hci::{self, opcodes};
use crate::protocol::{Frame, FrameKind};

use super::CommandSet;

/// Commands addressed to one connection whose completion echoes the handle.
///
/// Command parameters start with the handle; Command Complete return
/// parameters carry it right after the status byte.
const HANDLE_KEYED: &[u16] = &[
    opcodes::READ_TRANSMIT_POWER_LEVEL,
    opcodes::READ_RSSI,
    opcodes::LE_READ_CHANNEL_MAP,
    opcodes::LE_SET_DATA_LENGTH,
];

/// Connection handles use the low 12 bits.
const HANDLE_MASK: u16 = 0x0FFF;

fn handle_at(bytes: &[u8], at: usize) -> Option<u16> {
    let raw = bytes.get(at..at + 2)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]) & HANDLE_MASK)
}

fn key_for(opcode: u16, handle: Option<u16>) -> CorrelationKey {
    match handle {
        Some(handle) if HANDLE_KEYED.contains(&opcode) => CorrelationKey::with_handle(opcode, handle),
        _ => CorrelationKey::new(opcode),
    }
}

/// Generic BLE commands forwarded verbatim.
#[derive(Debug, Default)]
pub struct BleCommands;

impl BleCommands {
    pub fn new() -> Self {
        Self
    }
}

impl CommandSet for BleCommands {
    fn name(&self) -> &'static str {
        "ble"
    }

    fn encode_command(&self, command: &Frame) -> Result<Frame> {
        tracing::debug!(opcode = command.opcode(), "Passing HCI command through");
        Ok(Frame::command(command.opcode(), command.payload_bytes()))
    }

    fn decode_response(&self, reply: &Frame) -> Result<Frame> {
        match reply.kind() {
            FrameKind::Response => Ok(hci::command_complete(reply.opcode(), reply.payload())),
            FrameKind::Event => {
                let kind = match reply.opcode() {
                    hci::EVT_COMMAND_COMPLETE | hci::EVT_COMMAND_STATUS => FrameKind::Response,
                    _ => FrameKind::Event,
                };
                Ok(Frame::new(kind, reply.opcode(), reply.payload_bytes()))
            }
            FrameKind::Command => Err(BridgeError::malformed(format!(
                "IUT sent a command frame 0x{:04X}",
                reply.opcode()
            ))),
        }
    }

    fn command_key(&self, command: &Frame) -> CorrelationKey {
        key_for(command.opcode(), handle_at(command.payload(), 0))
    }

    fn reply_key(&self, reply: &Frame) -> Option<CorrelationKey> {
        match reply.kind() {
            // Return parameters: status, handle, ...
            FrameKind::Response => Some(key_for(reply.opcode(), handle_at(reply.payload(), 1))),
            FrameKind::Event => {
                let opcode = reply.command_opcode()?;
                let handle = reply.return_params().and_then(|params| handle_at(params, 1));
                Some(key_for(opcode, handle))
            }
            FrameKind::Command => None,
        }
    }
}
