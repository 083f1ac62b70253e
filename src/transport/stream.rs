//! Framed reading and writing over byte streams.
//!
//! # Example
//!
//! ```
//! use hci_bridge::protocol::{Frame, HciCodec};
//! use hci_bridge::transport::{FrameReader, FrameWriter};
//! use bytes::Bytes;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> hci_bridge::Result<()> {
//! let (a, b) = tokio::io::duplex(64);
//! let mut writer = FrameWriter::<_, HciCodec>::new(a);
//! let mut reader = FrameReader::<_, HciCodec>::new(b);
//!
//! writer.write_frame(&Frame::command(0x0C03, Bytes::new())).await?;
//! assert_eq!(reader.read_frame().await?.opcode(), 0x0C03);
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BridgeError, Result};
use crate::protocol::{Frame, FrameBuffer, FrameCodec};

/// Destination for outgoing frames.
///
/// Implemented by [`FrameWriter`] for direct writes and by
/// [`WriterHandle`](crate::writer::WriterHandle) for the writer task, so
/// the forwarding loops do not care which one owns the stream.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<()>;
}

/// Reads complete frames from a byte stream.
pub struct FrameReader<R, C: FrameCodec> {
    reader: R,
    buffer: FrameBuffer<C>,
}

impl<R, C> FrameReader<R, C>
where
    R: AsyncRead + Unpin,
    C: FrameCodec,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::new(),
        }
    }

    /// Wait for the next complete frame.
    ///
    /// Returns `MalformedFrame` once per garbage run (the bytes are already
    /// discarded, so the next call resumes after them) and `Closed` at end
    /// of stream, even when a partial frame is buffered.
    ///
    /// Cancel-safe: received bytes only ever move into the internal buffer,
    /// so dropping the future loses nothing.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.buffer.try_extract()? {
                return Ok(frame);
            }

            let n = self.reader.read_buf(self.buffer.spare()).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        codec = C::NAME,
                        buffered = self.buffer.len(),
                        "Stream closed with a partial frame"
                    );
                }
                return Err(BridgeError::Closed);
            }
            tracing::trace!(codec = C::NAME, bytes = n, "Read");
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Writes encoded frames to a byte stream.
pub struct FrameWriter<W, C: FrameCodec> {
    writer: W,
    scratch: BytesMut,
    _codec: PhantomData<C>,
}

impl<W, C> FrameWriter<W, C>
where
    W: AsyncWrite + Unpin,
    C: FrameCodec,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            scratch: BytesMut::with_capacity(512),
            _codec: PhantomData,
        }
    }

    /// Encode and write the whole frame, then flush.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.scratch.clear();
        C::encode(frame, &mut self.scratch)?;
        // write_all turns a zero-length write into WriteZero.
        self.writer.write_all(&self.scratch).await?;
        self.writer.flush().await?;
        tracing::trace!(codec = C::NAME, bytes = self.scratch.len(), "Wrote frame");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// The underlying stream, for writing unframed bytes.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

#[async_trait]
impl<W, C> FrameSink for FrameWriter<W, C>
where
    W: AsyncWrite + Unpin + Send,
    C: FrameCodec,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        self.write_frame(&frame).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::duplex;

    use super::*;
    use crate::protocol::{FrameKind, HciCodec, TwoWireCodec};

    #[tokio::test]
    async fn test_reassembles_split_reads() {
        let (mut tx, rx) = duplex(64);
        let mut reader = FrameReader::<_, TwoWireCodec>::new(rx);

        let writer = tokio::spawn(async move {
            for chunk in [&[0xA5, 0x02][..], &[0x0C, 0x03, 0x00], &[0x01, 0x00]] {
                tx.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tx
        });

        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.kind(), FrameKind::Response);
        assert_eq!(frame.opcode(), 0x0C03);
        assert_eq!(frame.payload(), &[0x00]);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_with_partial_frame() {
        let (mut tx, rx) = duplex(64);
        let mut reader = FrameReader::<_, HciCodec>::new(rx);

        tx.write_all(&[0x01, 0x03, 0x0C]).await.unwrap();
        drop(tx);

        assert!(matches!(reader.read_frame().await, Err(BridgeError::Closed)));
    }

    #[tokio::test]
    async fn test_garbage_is_reported_then_skipped() {
        let (mut tx, rx) = duplex(64);
        let mut reader = FrameReader::<_, HciCodec>::new(rx);

        tx.write_all(&[0x7F, 0x01, 0x03, 0x0C, 0x00]).await.unwrap();

        assert!(matches!(reader.read_frame().await, Err(BridgeError::MalformedFrame(_))));
        assert_eq!(reader.read_frame().await.unwrap().opcode(), 0x0C03);
    }

    #[tokio::test]
    async fn test_read_is_cancel_safe() {
        let (mut tx, rx) = duplex(64);
        let mut reader = FrameReader::<_, HciCodec>::new(rx);

        tx.write_all(&[0x01, 0x1F]).await.unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(20), reader.read_frame()).await;
        assert!(timed_out.is_err());
        assert_eq!(reader.buffered(), 2);

        tx.write_all(&[0x20, 0x00]).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().opcode(), 0x201F);
    }

    #[tokio::test]
    async fn test_writer_encodes_and_flushes() {
        let (tx, mut rx) = duplex(64);
        let mut writer = FrameWriter::<_, HciCodec>::new(tx);

        writer
            .send_frame(Frame::event(0x05, Bytes::from_static(&[0x00, 0x40, 0x00, 0x13])))
            .await
            .unwrap();

        let mut buf = [0u8; 7];
        rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x04, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13]);
    }

    #[tokio::test]
    async fn test_unencodable_frame_writes_nothing() {
        let (tx, mut rx) = duplex(64);
        let mut writer = FrameWriter::<_, HciCodec>::new(tx);

        let oversized = Frame::event(0x05, Bytes::from(vec![0u8; 300]));
        assert!(writer.write_frame(&oversized).await.is_err());
        drop(writer);

        let mut rest = Vec::new();
        rx.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
