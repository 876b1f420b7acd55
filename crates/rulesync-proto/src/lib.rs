//! rulesync protocol types and serialization.
//!
//! This crate defines the rule record and the change messages a master node
//! publishes for its replicas.
//!
//! # Modules
//!
//! - [`rule`] - The replicated rule record
//! - [`message`] - Add/delete change messages and their JSON encoding
//! - [`error`] - Protocol error types
//!
//! # Serialization
//!
//! Change messages are JSON documents of the form
//! `{"type": "add", "rule": {"id": "r1", ...}}`:
//!
//! ```
//! use rulesync_proto::{ChangeMessage, MessageType, Rule};
//!
//! let payload = ChangeMessage::add(Rule::new("r1", "timer.*")).encode().unwrap();
//! let message = ChangeMessage::decode(&payload).unwrap();
//! assert_eq!(message.kind, MessageType::Add);
//! ```

pub mod error;
pub mod message;
pub mod rule;

pub use error::Error;
pub use message::{ChangeMessage, MessageType, CONTENT_TYPE};
pub use rule::{Rule, RuleId};
