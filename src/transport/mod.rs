//! Transport module - byte streams to the tester and the IUT.
//!
//! A [`Transport`] is the pair of halves of one connection, boxed so the
//! bridge does not care whether it is a serial port, a socket or an
//! in-memory duplex. [`Transport::framed`] wraps them in a
//! [`FrameReader`]/[`FrameWriter`] for one codec.

mod endpoint;
mod stream;

use tokio::io::{AsyncRead, AsyncWrite};

pub use endpoint::{open, EndpointConfig, DEFAULT_BAUD_RATE};
pub use stream::{FrameReader, FrameSink, FrameWriter};

use crate::protocol::FrameCodec;

/// Read half of a transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One open connection.
pub struct Transport {
    name: String,
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl Transport {
    pub fn new(name: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
        }
    }

    /// Split a bidirectional stream into a transport.
    pub fn from_stream<S>(name: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(name, Box::new(reader), Box::new(writer))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frame both halves with codec `C`.
    pub fn framed<C: FrameCodec>(self) -> (FrameReader<BoxedReader, C>, FrameWriter<BoxedWriter, C>) {
        (FrameReader::new(self.reader), FrameWriter::new(self.writer))
    }

    pub fn into_parts(self) -> (String, BoxedReader, BoxedWriter) {
        (self.name, self.reader, self.writer)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("name", &self.name).finish_non_exhaustive()
    }
}
