//! Opening transports from configuration.
//!
//! - `serial`: UART through tokio-serial
//! - `tcp`: connect to a listening peer
//! - `tcp_listen`: accept exactly one peer
//! - `unix`: Unix domain socket (unix only)

use std::path::PathBuf;

use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_serial::SerialPortBuilderExt;

use super::Transport;
use crate::error::Result;

/// Default UART speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

/// Where a transport connects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// RTS/CTS hardware flow control.
        #[serde(default)]
        flow_control: bool,
    },
    Tcp {
        address: String,
    },
    TcpListen {
        address: String,
    },
    Unix {
        path: PathBuf,
    },
}

impl EndpointConfig {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Serial { port, baud_rate, .. } => format!("serial {} @ {}", port, baud_rate),
            Self::Tcp { address } => format!("tcp {}", address),
            Self::TcpListen { address } => format!("tcp listen {}", address),
            Self::Unix { path } => format!("unix {}", path.display()),
        }
    }
}

/// Open the endpoint and wrap it as a named transport.
pub async fn open(name: &str, endpoint: &EndpointConfig) -> Result<Transport> {
    tracing::debug!(transport = name, endpoint = %endpoint.describe(), "Opening transport");

    let transport = match endpoint {
        EndpointConfig::Serial {
            port,
            baud_rate,
            flow_control,
        } => {
            let flow = if *flow_control {
                tokio_serial::FlowControl::Hardware
            } else {
                tokio_serial::FlowControl::None
            };
            let stream = tokio_serial::new(port, *baud_rate)
                .flow_control(flow)
                .open_native_async()
                .map_err(|e| {
                    tracing::error!(port = %port, error = %e, "Failed to open serial port");
                    e
                })?;
            Transport::from_stream(name, stream)
        }
        EndpointConfig::Tcp { address } => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            tcp_transport(name, stream)
        }
        EndpointConfig::TcpListen { address } => {
            let listener = TcpListener::bind(address).await?;
            tracing::info!(transport = name, address = %listener.local_addr()?, "Waiting for peer");
            let (stream, peer) = listener.accept().await?;
            tracing::info!(transport = name, %peer, "Peer connected");
            stream.set_nodelay(true)?;
            tcp_transport(name, stream)
        }
        EndpointConfig::Unix { path } => unix_transport(name, path).await?,
    };

    tracing::info!(transport = name, endpoint = %endpoint.describe(), "Transport open");
    Ok(transport)
}

fn tcp_transport(name: &str, stream: TcpStream) -> Transport {
    let (reader, writer) = stream.into_split();
    Transport::new(name, Box::new(reader), Box::new(writer))
}

#[cfg(unix)]
async fn unix_transport(name: &str, path: &std::path::Path) -> Result<Transport> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    let (reader, writer) = stream.into_split();
    Ok(Transport::new(name, Box::new(reader), Box::new(writer)))
}

#[cfg(not(unix))]
async fn unix_transport(_name: &str, path: &std::path::Path) -> Result<Transport> {
    Err(crate::error::BridgeError::Config(format!(
        "unix socket {} is not supported on this platform",
        path.display()
    )))
}
