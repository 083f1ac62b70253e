//! Protocol module - frames, wire formats and stream reassembly.
//!
//! This module implements both sides of the bridge:
//! - HCI H4 framing toward the tester
//! - 2-wire framing toward the IUT
//! - Frame buffer for accumulating partial reads of either protocol

mod codec;
mod frame;
mod frame_buffer;
pub mod hci;
pub mod two_wire;

pub use codec::FrameCodec;
pub use frame::{Frame, FrameKind};
pub use frame_buffer::FrameBuffer;
pub use hci::{command_complete, HciCodec};
pub use two_wire::{TwoWireCodec, SYNC as TWO_WIRE_SYNC};
