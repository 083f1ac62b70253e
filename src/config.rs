//! Bridge configuration.
//!
//! Loaded from TOML, or JSON when the file extension is `.json`:
//!
//! ```toml
//! mode = "asynchronous"
//! command_set = "ble"
//! response_timeout_ms = 500
//!
//! [tester]
//! name = "tester"
//! endpoint = { kind = "serial", port = "/dev/ttyUSB0", baud_rate = 115200 }
//!
//! [iut]
//! endpoint = { kind = "tcp", address = "127.0.0.1:7000" }
//!
//! [[intercept]]
//! opcode = 0x0C03
//! status = 0x01
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::bridge::{BridgeSettings, Mode};
use crate::error::{BridgeError, Result};
use crate::handler::CommandSetKind;
use crate::intercept::{Interceptor, RuleConfig};
use crate::logging::LoggingConfig;
use crate::transport::EndpointConfig;
use crate::writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY};

fn default_drain_timeout_ms() -> u64 {
    2_000
}

fn default_writer_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

/// One side of the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSection {
    /// Friendly name used in logs.
    #[serde(default)]
    pub name: Option<String>,
    pub endpoint: EndpointConfig,
}

impl EndpointSection {
    pub fn name_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(fallback)
    }
}

/// Complete bridge configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub command_set: CommandSetKind,
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_writer_channel_capacity")]
    pub writer_channel_capacity: usize,
    pub tester: EndpointSection,
    pub iut: EndpointSection,
    #[serde(default)]
    pub intercept: Vec<RuleConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&text)?
        } else {
            Self::from_toml_str(&text)?
        };

        tracing::debug!(path = %path.display(), mode = ?config.mode, "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.response_timeout_ms == Some(0) {
            return Err(BridgeError::Config("response_timeout_ms must be positive".into()));
        }
        if self.writer_channel_capacity == 0 {
            return Err(BridgeError::Config("writer_channel_capacity must be positive".into()));
        }
        if self.tester.endpoint == self.iut.endpoint {
            return Err(BridgeError::Config(format!(
                "tester and IUT share the endpoint {}",
                self.tester.endpoint.describe()
            )));
        }
        Interceptor::from_config(&self.intercept)?;
        Ok(())
    }

    pub fn tester_name(&self) -> &str {
        self.tester.name_or("tester")
    }

    pub fn iut_name(&self) -> &str {
        self.iut.name_or("iut")
    }

    /// Runtime settings for [`Bridge`](crate::bridge::Bridge).
    pub fn settings(&self) -> BridgeSettings {
        BridgeSettings {
            mode: self.mode,
            response_timeout: self.response_timeout_ms.map(Duration::from_millis),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            writer: WriterConfig {
                channel_capacity: self.writer_channel_capacity,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const FULL: &str = r#"
mode = "synchronous"
command_set = "rf"
response_timeout_ms = 500
drain_timeout_ms = 100
writer_channel_capacity = 32

[tester]
name = "PTS"
endpoint = { kind = "serial", port = "/dev/ttyUSB0", baud_rate = 115200, flow_control = true }

[iut]
name = "DUT"
endpoint = { kind = "tcp", address = "127.0.0.1:7000" }

[[intercept]]
opcode = 0x0C03
kind = "response"
when = [{ offset = 3, value = 0x00 }]
status = 0x01

[[intercept]]
opcode = 0x201F
patch = { offset = 4, bytes = [0x10, 0x00] }

[logging]
level = "warn"
iut_debug = true
"#;

    const MINIMAL: &str = r#"
[tester]
endpoint = { kind = "tcp_listen", address = "0.0.0.0:6000" }

[iut]
endpoint = { kind = "unix", path = "/tmp/iut.sock" }
"#;

    #[test]
    fn test_parse_full() {
        let config = BridgeConfig::from_toml_str(FULL).unwrap();

        assert_eq!(config.mode, Mode::Synchronous);
        assert_eq!(config.command_set, CommandSetKind::Rf);
        assert_eq!(config.tester_name(), "PTS");
        assert_eq!(config.intercept.len(), 2);
        assert!(config.logging.iut_debug);

        let settings = config.settings();
        assert_eq!(settings.response_timeout, Some(Duration::from_millis(500)));
        assert_eq!(settings.drain_timeout, Duration::from_millis(100));
        assert_eq!(settings.writer.channel_capacity, 32);
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.mode, Mode::Asynchronous);
        assert_eq!(config.command_set, CommandSetKind::Ble);
        assert_eq!(config.response_timeout_ms, None);
        assert_eq!(config.drain_timeout_ms, 2_000);
        assert_eq!(config.writer_channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.tester_name(), "tester");
        assert_eq!(config.iut_name(), "iut");
        assert!(config.intercept.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let text = format!("{}\n[[intercept]]\nopcode = 0x0C03\n", MINIMAL);
        assert!(matches!(
            BridgeConfig::from_toml_str(&text),
            Err(BridgeError::InterceptionConfig(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let text = format!("response_timeout_ms = 0\n{}", MINIMAL);
        assert!(matches!(BridgeConfig::from_toml_str(&text), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_shared_endpoint_rejected() {
        let text = r#"
[tester]
endpoint = { kind = "tcp", address = "127.0.0.1:7000" }
[iut]
endpoint = { kind = "tcp", address = "127.0.0.1:7000" }
"#;
        assert!(matches!(BridgeConfig::from_toml_str(text), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = format!("verbose = true\n{}", MINIMAL);
        assert!(matches!(BridgeConfig::from_toml_str(&text), Err(BridgeError::Toml(_))));
    }

    #[test]
    fn test_load_json_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "mode": "asynchronous",
                "tester": {{ "endpoint": {{ "kind": "tcp", "address": "127.0.0.1:6000" }} }},
                "iut": {{ "endpoint": {{ "kind": "tcp", "address": "127.0.0.1:7000" }} }},
                "intercept": [{{ "opcode": 3075, "replace": [1, 3, 12, 0] }}]
            }}"#
        )
        .unwrap();

        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.intercept[0].opcode, 0x0C03);
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.iut_name(), "DUT");
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            BridgeConfig::load("/nonexistent/bridge.toml"),
            Err(BridgeError::Io(_))
        ));
    }
}
