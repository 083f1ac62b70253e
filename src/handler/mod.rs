//! Handler module - pluggable command sets.
//!
//! A [`CommandSet`] translates between the tester's HCI frames and the
//! IUT's 2-wire frames. One set is selected at startup and shared by both
//! forwarding loops as a trait object:
//!
//! - [`BleCommands`] - HCI carried unchanged inside 2-wire frames
//! - [`RfCommands`] - HCI LE test commands mapped to Direct Test Mode words
//!
//! # Example
//!
//! ```
//! use hci_bridge::handler::{CommandSetKind, build_command_set};
//! use hci_bridge::protocol::Frame;
//! use bytes::Bytes;
//!
//! let commands = build_command_set(CommandSetKind::Rf);
//! let reset = Frame::command(0x0C03, Bytes::new());
//! let wire = commands.encode_command(&reset).unwrap();
//! assert_eq!(wire.payload(), &[0x00, 0x00]);
//! ```

mod ble;
mod rf;

use serde::Deserialize;

pub use ble::BleCommands;
pub use rf::RfCommands;

use crate::correlation::CorrelationKey;
use crate::error::Result;
use crate::protocol::Frame;

/// Translation capabilities of one IUT flavour.
pub trait CommandSet: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Translate an HCI command into the 2-wire command for the IUT.
    ///
    /// Returns `UnsupportedCommand` for opcodes the set does not implement.
    fn encode_command(&self, command: &Frame) -> Result<Frame>;

    /// Translate a 2-wire response or event into the HCI frame for the tester.
    fn decode_response(&self, reply: &Frame) -> Result<Frame>;

    /// Correlation key of a tester command.
    fn command_key(&self, command: &Frame) -> CorrelationKey {
        CorrelationKey::new(command.opcode())
    }

    /// Correlation key of a 2-wire frame from the IUT.
    ///
    /// `None` marks a spontaneous event that answers no command.
    fn reply_key(&self, reply: &Frame) -> Option<CorrelationKey>;
}

/// Which command set to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CommandSetKind {
    /// HCI pass-through.
    #[default]
    Ble,
    /// Direct Test Mode.
    Rf,
}

/// Instantiate the configured command set.
pub fn build_command_set(kind: CommandSetKind) -> Box<dyn CommandSet> {
    match kind {
        CommandSetKind::Ble => Box::new(BleCommands::new()),
        CommandSetKind::Rf => Box::new(RfCommands::new()),
    }
}
