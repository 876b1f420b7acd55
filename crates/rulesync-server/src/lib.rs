//! rulesync server library.
//!
//! This crate provides the replication hub that keeps the rule tables of a
//! master node and its replicas in sync over a publish/subscribe bus, plus
//! the configuration and console used by the `rulesync-server` binary.

pub mod config;
pub mod console;
pub mod error;
pub mod hub;
pub mod stats;

pub use config::{Args, HubOptions, NodeConfig, Role};
pub use error::Error;
pub use hub::Hub;
pub use stats::{HubStats, StatsSnapshot};
