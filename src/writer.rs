//! Dedicated writer task for the tester-facing stream.
//!
//! In asynchronous mode both forwarding loops produce frames for the
//! tester: replies and events from the IUT loop, locally generated
//! completions from the command loop. Rather than sharing the write half
//! behind a mutex, a single task owns it and receives frames over an mpsc
//! channel.
//!
//! ```text
//! IUT -> tester loop ─┐
//!                     ├─► mpsc::Sender<Frame> ─► Writer Task ─► tester
//! tester -> IUT loop ─┘
//! ```
//!
//! The channel is bounded, so a slow tester pushes back on both loops.
//! Frames that are ready together are encoded into one buffer and written
//! with a single flush.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};
use crate::protocol::{Frame, FrameCodec};
use crate::transport::FrameSink;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; the task exits once every handle is dropped.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Frame>,
}

impl WriterHandle {
    /// Queue a frame, waiting while the channel is full.
    ///
    /// Fails with `Closed` once the writer task has stopped.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| BridgeError::Closed)
    }
}

#[async_trait]
impl FrameSink for WriterHandle {
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        self.send(frame).await
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The `JoinHandle` resolves when every handle is dropped (`Ok`) or the
/// stream fails (`Err`).
pub fn spawn_writer_task<W, C>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    C: FrameCodec,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop::<W, C>(rx, writer));

    (WriterHandle { tx }, task)
}

async fn writer_loop<W, C>(mut rx: mpsc::Receiver<Frame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
    C: FrameCodec,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => break,
        };

        // Collect additional ready frames without waiting.
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        buf.clear();
        for frame in &batch {
            let mark = buf.len();
            // The bridge checks frames before queueing them.
            if let Err(e) = C::encode(frame, &mut buf) {
                buf.truncate(mark);
                tracing::warn!(codec = C::NAME, error = %e, %frame, "Dropping unencodable frame");
            }
        }

        writer.write_all(&buf).await?;
        writer.flush().await?;

        tracing::trace!(codec = C::NAME, frames = batch.len(), bytes = buf.len(), "Wrote batch");
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "Writer shutdown failed");
    }
    Ok(())
}
