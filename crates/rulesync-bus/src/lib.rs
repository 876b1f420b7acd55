//! rulesync bus - publish/subscribe transports.
//!
//! This crate defines the broker interface the replication hub talks to and
//! two implementations of it:
//!
//! - [`memory`] - An in-process broker with exchanges, queues and bindings
//! - [`network`] - NNG sockets plus a small forwarding broker
//!
//! Pick one from a DSN with [`create_transport`].

pub mod error;
pub mod memory;
pub mod network;
pub mod transport;

use std::sync::Arc;

pub use error::Error;
pub use memory::MemoryBroker;
pub use network::{BrokerAddresses, BrokerHandle, NngBroker, NngTransport};
pub use transport::{
    Channel, ConsumeOptions, Connection, Deliveries, Delivery, ExchangeKind, ExchangeOptions,
    Publishing, QueueInfo, QueueOptions, SharedTransport, Transport,
};

/// Create the transport that serves `dsn`.
///
/// `memory://` DSNs share the process-wide [`MemoryBroker::global`];
/// `tcp://` and `ipc://` DSNs use [`NngTransport`].
pub fn create_transport(dsn: &str) -> Result<SharedTransport, Error> {
    if dsn.starts_with(memory::SCHEME) {
        return Ok(Arc::new(MemoryBroker::global()));
    }
    if network::supports(dsn) {
        return Ok(Arc::new(NngTransport::new()));
    }
    Err(Error::InvalidDsn(format!(
        "{} (expected memory://, tcp:// or ipc://)",
        dsn
    )))
}
