//! Event interception: rewrite selected tester-bound frames.
//!
//! Rules are loaded once from configuration and evaluated in order; the
//! first rule whose predicate matches rewrites the frame and evaluation
//! stops. Frames matching no rule pass through unchanged.
//!
//! # Example
//!
//! ```
//! use hci_bridge::intercept::{Action, Interceptor, InterceptionRule};
//! use hci_bridge::protocol::{command_complete, hci::opcodes};
//!
//! // Make every Reset completion report "Unknown HCI Command".
//! let interceptor = Interceptor::new(vec![
//!     InterceptionRule::new(opcodes::RESET, Action::Status(0x01)),
//! ]);
//!
//! let event = command_complete(opcodes::RESET, &[0x00]);
//! let forwarded = interceptor.apply(&event);
//! assert_eq!(forwarded.payload(), &[0x01, 0x03, 0x0C, 0x01]);
//! ```

use bytes::{Bytes, BytesMut};
use serde::Deserialize;

use crate::error::{BridgeError, Result};
use crate::protocol::hci::MAX_PARAMS;
use crate::protocol::{Frame, FrameKind};

/// Predicate on one payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldMatch {
    pub offset: usize,
    pub value: u8,
}

impl FieldMatch {
    fn matches(&self, payload: &[u8]) -> bool {
        payload.get(self.offset) == Some(&self.value)
    }
}

/// Payload rewrite performed by a matching rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Replace the whole payload.
    Replace(Bytes),
    /// Overwrite bytes at `offset`, zero-extending a shorter payload.
    Patch { offset: usize, bytes: Bytes },
    /// Replace the status byte.
    Status(u8),
}

impl Action {
    fn rewrite(&self, frame: &Frame) -> Frame {
        match self {
            Self::Replace(payload) => frame.with_payload(payload.clone()),
            Self::Patch { offset, bytes } => {
                let end = offset + bytes.len();
                let mut payload = BytesMut::from(frame.payload());
                if payload.len() < end {
                    payload.resize(end, 0);
                }
                payload[*offset..end].copy_from_slice(bytes);
                frame.with_payload(payload.freeze())
            }
            Self::Status(value) => match frame.status_offset() {
                Some(at) if at < frame.payload_len() => {
                    let mut payload = BytesMut::from(frame.payload());
                    payload[at] = *value;
                    frame.with_payload(payload.freeze())
                }
                _ => {
                    tracing::debug!(%frame, "Frame has no status byte, left unchanged");
                    frame.clone()
                }
            },
        }
    }
}

/// One trigger → transform pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptionRule {
    /// Matched against [`Frame::match_opcode`].
    pub opcode: u16,
    pub kind: Option<FrameKind>,
    pub fields: Vec<FieldMatch>,
    pub action: Action,
}

impl InterceptionRule {
    /// A rule matching every frame answering or carrying `opcode`.
    pub fn new(opcode: u16, action: Action) -> Self {
        Self {
            opcode,
            kind: None,
            fields: Vec::new(),
            action,
        }
    }

    /// Restrict the rule to one frame kind.
    pub fn kind(mut self, kind: FrameKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Require a payload byte to hold a value.
    pub fn when(mut self, offset: usize, value: u8) -> Self {
        self.fields.push(FieldMatch { offset, value });
        self
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        frame.match_opcode() == self.opcode
            && self.kind.map_or(true, |kind| kind == frame.kind())
            && self.fields.iter().all(|f| f.matches(frame.payload()))
    }
}

/// Patch description as written in configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchConfig {
    pub offset: usize,
    pub bytes: Vec<u8>,
}

/// An interception rule as written in configuration.
///
/// Exactly one of `status`, `replace` and `patch` must be given.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub opcode: u16,
    #[serde(default)]
    pub kind: Option<FrameKind>,
    #[serde(default)]
    pub when: Vec<FieldMatch>,
    #[serde(default)]
    pub status: Option<u8>,
    #[serde(default)]
    pub replace: Option<Vec<u8>>,
    #[serde(default)]
    pub patch: Option<PatchConfig>,
}

impl RuleConfig {
    /// Validate and compile into a rule.
    pub fn compile(&self) -> Result<InterceptionRule> {
        let action = match (self.status, &self.replace, &self.patch) {
            (Some(status), None, None) => Action::Status(status),
            (None, Some(replace), None) => {
                if replace.len() > MAX_PARAMS {
                    return Err(self.invalid(format!(
                        "replacement payload is {} bytes, limit is {}",
                        replace.len(),
                        MAX_PARAMS
                    )));
                }
                Action::Replace(Bytes::copy_from_slice(replace))
            }
            (None, None, Some(patch)) => {
                if patch.bytes.is_empty() {
                    return Err(self.invalid("patch has no bytes".to_string()));
                }
                if patch.offset + patch.bytes.len() > MAX_PARAMS {
                    return Err(self.invalid(format!(
                        "patch ends at byte {}, limit is {}",
                        patch.offset + patch.bytes.len(),
                        MAX_PARAMS
                    )));
                }
                Action::Patch {
                    offset: patch.offset,
                    bytes: Bytes::copy_from_slice(&patch.bytes),
                }
            }
            (None, None, None) => {
                return Err(self.invalid("one of status, replace or patch is required".to_string()))
            }
            _ => {
                return Err(self.invalid(
                    "only one of status, replace or patch may be given".to_string(),
                ))
            }
        };

        Ok(InterceptionRule {
            opcode: self.opcode,
            kind: self.kind,
            fields: self.when.clone(),
            action,
        })
    }

    fn invalid(&self, reason: String) -> BridgeError {
        BridgeError::InterceptionConfig(format!("rule for opcode 0x{:04X}: {}", self.opcode, reason))
    }
}

/// Ordered, immutable rule set.
#[derive(Debug, Clone, Default)]
pub struct Interceptor {
    rules: Vec<InterceptionRule>,
}

impl Interceptor {
    pub fn new(rules: Vec<InterceptionRule>) -> Self {
        Self { rules }
    }

    /// Compile every configured rule; the first invalid one aborts loading.
    pub fn from_config(rules: &[RuleConfig]) -> Result<Self> {
        let rules = rules.iter().map(RuleConfig::compile).collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[InterceptionRule] {
        &self.rules
    }

    /// Rewritten frame if a rule matched.
    pub fn intercept(&self, frame: &Frame) -> Option<Frame> {
        let (index, rule) = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(frame))?;
        let rewritten = rule.action.rewrite(frame);
        tracing::debug!(rule = index, original = %frame, rewritten = %rewritten, "Intercepted frame");
        Some(rewritten)
    }

    /// Frame to forward: rewritten by the first matching rule, or unchanged.
    pub fn apply(&self, frame: &Frame) -> Frame {
        self.intercept(frame).unwrap_or_else(|| frame.clone())
    }
}
