//! Change messages exchanged between master and replicas.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::rule::Rule;

/// Content type attached to published change messages.
pub const CONTENT_TYPE: &str = "text/plain";

/// Kind of rule change carried by a [`ChangeMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A rule was added or replaced.
    Add,
    /// A rule was removed.
    Delete,
}

impl MessageType {
    /// Wire discriminator for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Add => "add",
            MessageType::Delete => "delete",
        }
    }

    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "add" => Some(MessageType::Add),
            "delete" => Some(MessageType::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rule change.
///
/// On the wire this is a JSON object `{"type": "add" | "delete", "rule": {...}}`.
/// For deletions the full removed rule is sent, but receivers only look at
/// its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// Kind of change.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// The rule that changed.
    pub rule: Rule,
}

/// Lenient view of an incoming payload, so that a null rule and an unknown
/// type can be told apart from garbage.
#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    rule: Option<Rule>,
}

impl ChangeMessage {
    /// Create a message of the given kind.
    pub fn new(kind: MessageType, rule: Rule) -> Self {
        Self { kind, rule }
    }

    /// Create an add message.
    pub fn add(rule: Rule) -> Self {
        Self::new(MessageType::Add, rule)
    }

    /// Create a delete message.
    pub fn delete(rule: Rule) -> Self {
        Self::new(MessageType::Delete, rule)
    }

    /// Serialize to the wire payload.
    pub fn encode(&self) -> Result<Bytes, Error> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(format!("failed to encode change message: {}", e)))
    }

    /// Parse a wire payload.
    ///
    /// Fails on unparseable input, on anything but a JSON object (for the
    /// message and its rule), on a missing or null rule, and on a type other
    /// than `add` / `delete`.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_slice(payload).map_err(decode_error)?;

        let object = value.as_object().ok_or_else(|| {
            Error::Deserialization("change message is not a JSON object".to_string())
        })?;
        // serde would otherwise accept the positional (array) form of a struct
        if matches!(object.get("rule"), Some(rule) if !rule.is_object() && !rule.is_null()) {
            return Err(Error::Deserialization("rule is not a JSON object".to_string()));
        }

        let raw: RawMessage = serde_json::from_value(value).map_err(decode_error)?;

        let rule = raw.rule.ok_or_else(|| Error::MissingRule(raw.kind.clone()))?;
        let kind = MessageType::from_wire(&raw.kind).ok_or(Error::UnknownType(raw.kind))?;

        Ok(Self { kind, rule })
    }
}

fn decode_error(e: serde_json::Error) -> Error {
    Error::Deserialization(format!("failed to decode change message: {}", e))
}

impl fmt::Display for ChangeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rule {}", self.kind, self.rule.id)
    }
}
