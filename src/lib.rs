//! # hci-bridge
//!
//! Bridge between a test controller speaking HCI over UART (H4 framing)
//! and an Implementation Under Test speaking a framed 2-wire protocol.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): HCI and 2-wire codecs plus a reassembly buffer
//! - **Transport** ([`transport`]): framed readers/writers over serial ports,
//!   sockets or in-memory streams
//! - **Command sets** ([`handler`]): HCI pass-through (`ble`) or Direct Test
//!   Mode words (`rf`)
//! - **Bridge** ([`bridge`]): correlation, interception and the forwarding loops
//!
//! ## Example
//!
//! ```no_run
//! use hci_bridge::bridge::{Bridge, ShutdownSignal};
//! use hci_bridge::config::BridgeConfig;
//! use hci_bridge::transport;
//!
//! # async fn start() -> hci_bridge::Result<()> {
//! let config = BridgeConfig::load("bridge.toml")?;
//! let bridge = Bridge::from_config(&config)?;
//!
//! let tester = transport::open(config.tester_name(), &config.tester.endpoint).await?;
//! let iut = transport::open(config.iut_name(), &config.iut.endpoint).await?;
//!
//! let report = bridge.run(tester, iut, ShutdownSignal::new()).await;
//! println!("{:?}", report.stats);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod correlation;
pub mod error;
pub mod handler;
pub mod intercept;
pub mod logging;
pub mod protocol;
pub mod transport;
pub mod writer;

pub use bridge::{Bridge, BridgeReport, ShutdownSignal};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
