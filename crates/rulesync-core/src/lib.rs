//! rulesync core - the local rule table.
//!
//! This crate provides [`RuleStore`], the in-memory rule table a node keeps,
//! and the [`RuleChangeSource`] interface the replication hub depends on.

pub mod store;

pub use store::{ListenerId, RuleChangeSource, RuleStore, SharedRuleStore};

/// Re-export protocol types.
pub use rulesync_proto as proto;
