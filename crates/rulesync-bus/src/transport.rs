//! Bus transport interface.
//!
//! The shape follows an AMQP-style broker: a [`Transport`] dials a
//! [`Connection`], which opens [`Channel`]s used to declare exchanges and
//! queues, bind them, publish, and consume.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Error;

/// Exchange routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Deliver to every bound queue, ignoring the routing key.
    Fanout,
    /// Deliver to queues bound with exactly the message routing key.
    Direct,
}

impl ExchangeKind {
    /// Broker name of the exchange kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct => "direct",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange declaration arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
}

impl ExchangeOptions {
    /// A non-durable fanout exchange.
    pub fn fanout() -> Self {
        Self {
            kind: ExchangeKind::Fanout,
            durable: false,
            auto_delete: false,
            internal: false,
            no_wait: false,
        }
    }

    /// A non-durable direct exchange.
    pub fn direct() -> Self {
        Self {
            kind: ExchangeKind::Direct,
            ..Self::fanout()
        }
    }
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self::fanout()
    }
}

/// Queue declaration arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    /// Restrict the queue to the declaring connection.
    pub exclusive: bool,
    pub no_wait: bool,
}

/// Broker view of a declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Queue name (generated by the broker when declared with an empty name).
    pub name: String,
    /// Messages waiting for a consumer.
    pub messages: usize,
    /// Active consumers.
    pub consumers: usize,
}

/// Consumption arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Messages count as acknowledged on delivery.
    pub auto_ack: bool,
    /// Refuse other consumers on the queue.
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            auto_ack: true,
            exclusive: false,
            no_local: false,
            no_wait: false,
        }
    }
}

/// An outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publishing {
    pub content_type: String,
    pub body: Bytes,
}

impl Publishing {
    /// Create a message with the given content type.
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }
}

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key used at publish time.
    pub routing_key: String,
    /// Content type set by the publisher, if the transport carries it.
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Sequence of deliveries for one consumer.
///
/// Ends (yields `None`) when the consumer is cancelled or the connection is
/// closed.
pub type Deliveries = mpsc::UnboundedReceiver<Delivery>;

/// Something that can dial a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the broker named by `dsn`, in virtual host `vhost`.
    async fn dial(&self, dsn: &str, vhost: &str) -> Result<Arc<dyn Connection>, Error>;
}

/// An open broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a channel on this connection.
    async fn open_channel(&self) -> Result<Box<dyn Channel>, Error>;

    /// Close the connection.
    ///
    /// Ends every delivery sequence of the connection and makes later calls
    /// on its channels fail with [`Error::ConnectionClosed`].
    async fn close(&self) -> Result<(), Error>;

    /// Whether [`Connection::close`] has been called.
    fn is_closed(&self) -> bool;
}

/// A channel; used by a single task at a time.
#[async_trait]
pub trait Channel: Send {
    async fn declare_exchange(
        &mut self,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<(), Error>;

    async fn declare_queue(
        &mut self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, Error>;

    async fn bind_queue(
        &mut self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), Error>;

    /// Publish a message. Success means the transport accepted it, not that
    /// any consumer received it.
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: Publishing,
    ) -> Result<(), Error>;

    async fn consume(&mut self, queue: &str, options: ConsumeOptions) -> Result<Deliveries, Error>;

    /// Close the channel, cancelling its consumers.
    async fn close(&mut self) -> Result<(), Error>;
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn Transport>;
