//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Payload could not be parsed as a change message.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Message parsed but carried no rule.
    #[error("message of type {0:?} has no rule payload")]
    MissingRule(String),

    /// Message type is neither "add" nor "delete".
    #[error("unknown message type: {0:?}")]
    UnknownType(String),
}
