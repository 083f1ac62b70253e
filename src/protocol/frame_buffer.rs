//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management and a small state machine:
//! - `WaitingForHeader`: the codec cannot size the frame yet
//! - `WaitingForFrame`: header parsed, need N bytes in total
//!
//! # Example
//!
//! ```
//! use hci_bridge::protocol::{FrameBuffer, HciCodec};
//!
//! let mut buffer = FrameBuffer::<HciCodec>::new();
//!
//! // Reset command split across two reads
//! buffer.extend(&[0x01, 0x03]);
//! assert!(buffer.try_extract().unwrap().is_none());
//!
//! buffer.extend(&[0x0C, 0x00]);
//! let frame = buffer.try_extract().unwrap().unwrap();
//! assert_eq!(frame.opcode(), 0x0C03);
//! ```

use std::marker::PhantomData;

use bytes::BytesMut;

use super::codec::FrameCodec;
use super::Frame;
use crate::error::Result;

/// Initial buffer capacity.
const DEFAULT_CAPACITY: usize = 4 * 1024;

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForFrame { len: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer<C: FrameCodec> {
    buffer: BytesMut,
    state: State,
    _codec: PhantomData<C>,
}

impl<C: FrameCodec> FrameBuffer<C> {
    /// Create a new frame buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_CAPACITY),
            state: State::WaitingForHeader,
            _codec: PhantomData,
        }
    }

    /// Append data to the buffer without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Mutable access to the backing buffer for `read_buf`-style reads.
    pub(crate) fn spare(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Push data and extract every complete frame.
    ///
    /// Malformed frames are skipped; their errors are returned alongside
    /// the good frames in arrival order.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Frame>> {
        self.extend(data);

        let mut out = Vec::new();
        loop {
            match self.try_extract() {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(MalformedFrame)` if the bytes at the head are not a valid
    ///   header; they are discarded before returning, so calling again
    ///   continues with whatever follows
    pub fn try_extract(&mut self) -> Result<Option<Frame>> {
        if let State::WaitingForHeader = self.state {
            match C::frame_len(&self.buffer) {
                Ok(Some(len)) => self.state = State::WaitingForFrame { len },
                Ok(None) => return Ok(None),
                Err(e) => {
                    let skip = C::resync(&self.buffer);
                    let _ = self.buffer.split_to(skip);
                    tracing::debug!(codec = C::NAME, skipped = skip, "Discarded malformed bytes");
                    return Err(e);
                }
            }
        }

        let State::WaitingForFrame { len } = self.state else {
            return Ok(None);
        };
        if self.buffer.len() < len {
            return Ok(None);
        }

        let raw = self.buffer.split_to(len);
        self.state = State::WaitingForHeader;
        C::decode_exact(&raw).map(Some)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForFrame { .. } => "WaitingForFrame",
        }
    }
}

impl<C: FrameCodec> Default for FrameBuffer<C> {
    fn default() -> Self {
        Self::new()
    }
}
