//! Direct Test Mode command set for RF-PHY testing.
//!
//! The IUT speaks the 16-bit DTM command words of the Bluetooth 2-wire
//! UART interface. Each supported HCI command becomes one 2-wire command
//! whose payload is the sequence of DTM words (big-endian) to execute;
//! the IUT answers with one 2-wire response carrying one reply word per
//! command word.
//!
//! ```text
//! ┌──────┬─────────┬───────────┬─────┐
//! │ Cmd  │ Control │ Parameter │ Pkt │
//! │ 2 bit│ 6 bit   │ 6 bit     │2 bit│
//! └──────┴─────────┴───────────┴─────┘
//! ```

use bytes::{BufMut, BytesMut};

use crate::correlation::CorrelationKey;
use crate::error::{BridgeError, Result};
use crate::protocol::hci::{self, opcodes, status};
use crate::protocol::{Frame, FrameKind};

use super::CommandSet;

const CMD_SETUP: u16 = 0b00;
const CMD_RX_TEST: u16 = 0b01;
const CMD_TX_TEST: u16 = 0b10;
const CMD_TEST_END: u16 = 0b11;

const SETUP_RESET: u8 = 0;
const SETUP_LENGTH_UPPER: u8 = 1;
const SETUP_PHY: u8 = 2;
const SETUP_MODULATION_INDEX: u8 = 3;

/// Reply word bit marking a packet report.
const PACKET_REPORT: u16 = 0x8000;
/// Packet counter of a packet report.
const PACKET_COUNT_MASK: u16 = 0x7FFF;

/// Longest payload a TX word can describe without the length setup word.
const SHORT_PACKET_MAX: u8 = 0x3F;

/// Pack one DTM command word.
pub fn dtm_word(cmd: u16, control: u8, parameter: u8, pkt: u8) -> u16 {
    (cmd << 14)
        | ((control as u16 & 0x3F) << 8)
        | ((parameter as u16 & 0x3F) << 2)
        | (pkt as u16 & 0x03)
}

/// The 2-wire interface has four packet types; HCI payload 4 (11110000)
/// maps to the third and everything unsupported falls back to it.
fn map_payload_type(hci_payload: u8) -> u8 {
    match hci_payload {
        0 => 0,
        1 => 1,
        2 => 2,
        _ => 3,
    }
}

fn require(params: &[u8], min: usize, opcode: u16) -> Result<()> {
    if params.len() < min {
        return Err(BridgeError::malformed(format!(
            "command 0x{:04X} needs {} parameter bytes, got {}",
            opcode,
            min,
            params.len()
        )));
    }
    Ok(())
}

/// HCI LE test commands over Direct Test Mode.
#[derive(Debug, Default)]
pub struct RfCommands;

impl RfCommands {
    pub fn new() -> Self {
        Self
    }

    fn transmitter_words(opcode: u16, params: &[u8]) -> Result<Vec<u16>> {
        let min = if opcode == opcodes::LE_TRANSMITTER_TEST_V1 { 3 } else { 4 };
        require(params, min, opcode)?;

        let (channel, length, payload) = (params[0], params[1], map_payload_type(params[2]));
        let mut words = Vec::with_capacity(3);

        match opcode {
            opcodes::LE_TRANSMITTER_TEST_V2 => {
                words.push(dtm_word(CMD_SETUP, SETUP_PHY, params[3], 0));
            }
            opcodes::LE_TRANSMITTER_TEST_V3 => {
                tracing::warn!("Transmitter Test v3 extensions not supported, sending basic test");
            }
            _ => {}
        }
        if length > SHORT_PACKET_MAX {
            words.push(dtm_word(CMD_SETUP, SETUP_LENGTH_UPPER, length >> 6, 0));
        }
        words.push(dtm_word(CMD_TX_TEST, channel, length & SHORT_PACKET_MAX, payload));
        Ok(words)
    }

    fn receiver_words(opcode: u16, params: &[u8]) -> Result<Vec<u16>> {
        let min = if opcode == opcodes::LE_RECEIVER_TEST_V1 { 1 } else { 3 };
        require(params, min, opcode)?;

        let mut words = Vec::with_capacity(3);
        match opcode {
            opcodes::LE_RECEIVER_TEST_V2 => {
                words.push(dtm_word(CMD_SETUP, SETUP_PHY, params[1], 0));
                words.push(dtm_word(CMD_SETUP, SETUP_MODULATION_INDEX, params[2], 0));
            }
            opcodes::LE_RECEIVER_TEST_V3 => {
                tracing::warn!("Receiver Test v3 extensions not supported, sending basic test");
            }
            _ => {}
        }
        words.push(dtm_word(CMD_RX_TEST, params[0], 0, 0));
        Ok(words)
    }

    fn reply_words(reply: &Frame) -> Result<Vec<u16>> {
        if reply.payload_len() % 2 != 0 {
            return Err(BridgeError::malformed(format!(
                "DTM reply for 0x{:04X} has odd length {}",
                reply.opcode(),
                reply.payload_len()
            )));
        }
        Ok(reply
            .payload()
            .chunks_exact(2)
            .map(|w| u16::from_be_bytes([w[0], w[1]]))
            .collect())
    }

    fn all_succeeded(words: &[u16]) -> bool {
        !words.is_empty() && words.iter().all(|&w| w == 0x0000)
    }
}

impl CommandSet for RfCommands {
    fn name(&self) -> &'static str {
        "rf"
    }

    fn encode_command(&self, command: &Frame) -> Result<Frame> {
        let opcode = command.opcode();
        let params = command.payload();

        let words = match opcode {
            opcodes::RESET => vec![dtm_word(CMD_SETUP, SETUP_RESET, 0, 0)],
            opcodes::LE_TRANSMITTER_TEST_V1
            | opcodes::LE_TRANSMITTER_TEST_V2
            | opcodes::LE_TRANSMITTER_TEST_V3 => Self::transmitter_words(opcode, params)?,
            opcodes::LE_RECEIVER_TEST_V1
            | opcodes::LE_RECEIVER_TEST_V2
            | opcodes::LE_RECEIVER_TEST_V3 => Self::receiver_words(opcode, params)?,
            opcodes::LE_TEST_END => vec![dtm_word(CMD_TEST_END, 0, 0, 0)],
            other => return Err(BridgeError::UnsupportedCommand(other)),
        };

        let mut payload = BytesMut::with_capacity(words.len() * 2);
        for word in &words {
            tracing::debug!(opcode, word = format_args!("{:04x}", word), "DTM word");
            payload.put_u16(*word);
        }
        Ok(Frame::command(opcode, payload.freeze()))
    }

    fn decode_response(&self, reply: &Frame) -> Result<Frame> {
        if reply.kind() != FrameKind::Response {
            // Anything else the IUT reports is forwarded as a plain event.
            let code = u8::try_from(reply.opcode()).map_err(|_| {
                BridgeError::malformed(format!("event code 0x{:04X} is not an HCI event", reply.opcode()))
            })?;
            return Ok(Frame::event(u16::from(code), reply.payload_bytes()));
        }

        let opcode = reply.opcode();
        let words = Self::reply_words(reply)?;
        tracing::debug!(opcode, ?words, "DTM reply");

        let params: Vec<u8> = match opcode {
            opcodes::RESET => {
                if Self::all_succeeded(&words) {
                    vec![status::SUCCESS]
                } else {
                    vec![status::UNSPECIFIED_ERROR]
                }
            }
            opcodes::LE_TRANSMITTER_TEST_V1
            | opcodes::LE_TRANSMITTER_TEST_V2
            | opcodes::LE_TRANSMITTER_TEST_V3
            | opcodes::LE_RECEIVER_TEST_V1
            | opcodes::LE_RECEIVER_TEST_V2
            | opcodes::LE_RECEIVER_TEST_V3 => {
                if Self::all_succeeded(&words) {
                    vec![status::SUCCESS]
                } else {
                    vec![status::UNKNOWN_COMMAND]
                }
            }
            opcodes::LE_TEST_END => match words.first() {
                Some(&word) if word & PACKET_REPORT != 0 => {
                    let count = word & PACKET_COUNT_MASK;
                    tracing::debug!(packets = count, "Test End report");
                    let [lo, hi] = count.to_le_bytes();
                    vec![status::SUCCESS, lo, hi]
                }
                _ => {
                    tracing::debug!("Test End failed");
                    vec![status::UNKNOWN_COMMAND]
                }
            },
            other => return Err(BridgeError::UnsupportedCommand(other)),
        };

        Ok(hci::command_complete(opcode, &params))
    }

    fn reply_key(&self, reply: &Frame) -> Option<CorrelationKey> {
        (reply.kind() == FrameKind::Response).then(|| CorrelationKey::new(reply.opcode()))
    }
}
