//! In-process broker with exchange, queue and binding semantics.
//!
//! Behaves like a small AMQP broker: exchanges route to bound queues, queues
//! buffer until a consumer attaches, consumers of one queue are served
//! round-robin. Used for single-process deployments and for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::Error;
use crate::transport::{
    Channel, ConsumeOptions, Connection, Deliveries, Delivery, ExchangeKind, ExchangeOptions,
    Publishing, QueueInfo, QueueOptions, Transport,
};

/// DSN scheme served by [`MemoryBroker`].
pub const SCHEME: &str = "memory://";

/// Prefix reserved for broker-owned names.
const RESERVED_PREFIX: &str = "amq.";

static GLOBAL: OnceLock<MemoryBroker> = OnceLock::new();

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct Consumer {
    connection: u64,
    channel: u64,
    exclusive: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Queue {
    buffer: VecDeque<Delivery>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    /// Owning connection of an exclusive queue.
    owner: Option<u64>,
}

impl Queue {
    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            messages: self.buffer.len(),
            consumers: self.consumers.len(),
        }
    }

    /// Hand a message to the next live consumer, or buffer it.
    fn deliver(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let index = self.next_consumer % self.consumers.len();
            match self.consumers[index].tx.send(delivery) {
                Ok(()) => {
                    self.next_consumer = index + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // Receiver dropped; forget the consumer and retry.
                    self.consumers.remove(index);
                    delivery = returned;
                }
            }
        }
        self.buffer.push_back(delivery);
    }
}

#[derive(Default)]
struct VirtualHost {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

impl VirtualHost {
    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|binding| binding.queue != name);
        }
    }
}

struct BrokerInner {
    vhosts: Mutex<HashMap<String, VirtualHost>>,
    refuse_connections: AtomicBool,
    next_id: AtomicU64,
}

/// An in-process message broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                vhosts: Mutex::new(HashMap::new()),
                refuse_connections: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The process-wide broker behind `memory://` DSNs.
    pub fn global() -> Self {
        GLOBAL.get_or_init(MemoryBroker::new).clone()
    }

    /// Make later dials fail with [`Error::ConnectionRefused`].
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Whether an exchange has been declared.
    pub fn exchange_exists(&self, vhost: &str, exchange: &str) -> bool {
        self.inner
            .vhosts
            .lock()
            .get(vhost)
            .is_some_and(|host| host.exchanges.contains_key(exchange))
    }

    /// Inspect a queue.
    pub fn queue_info(&self, vhost: &str, queue: &str) -> Option<QueueInfo> {
        self.inner
            .vhosts
            .lock()
            .get(vhost)
            .and_then(|host| host.queues.get(queue).map(|q| q.info(queue)))
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn with_vhost<T>(&self, vhost: &str, f: impl FnOnce(&mut VirtualHost) -> T) -> T {
        let mut vhosts = self.inner.vhosts.lock();
        f(vhosts.entry(vhost.to_string()).or_default())
    }

    /// Drop consumers and exclusive queues owned by a connection.
    fn release_connection(&self, vhost: &str, connection: u64) {
        self.with_vhost(vhost, |host| {
            let owned: Vec<String> = host
                .queues
                .iter()
                .filter(|(_, queue)| queue.owner == Some(connection))
                .map(|(name, _)| name.clone())
                .collect();
            for name in owned {
                host.remove_queue(&name);
            }
            for queue in host.queues.values_mut() {
                queue.consumers.retain(|c| c.connection != connection);
            }
        });
    }

    fn release_channel(&self, vhost: &str, channel: u64) {
        self.with_vhost(vhost, |host| {
            for queue in host.queues.values_mut() {
                queue.consumers.retain(|c| c.channel != channel);
            }
        });
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn dial(&self, dsn: &str, vhost: &str) -> Result<Arc<dyn Connection>, Error> {
        if !dsn.starts_with(SCHEME) {
            return Err(Error::InvalidDsn(format!(
                "{} (expected {}<name>)",
                dsn, SCHEME
            )));
        }
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(Error::ConnectionRefused(dsn.to_string()));
        }

        let id = self.next_id();
        self.with_vhost(vhost, |_| ());
        debug!(connection = id, dsn, vhost, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            vhost: vhost.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    vhost: String,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
            id: self.broker.next_id(),
            vhost: self.vhost.clone(),
            connection_closed: self.closed.clone(),
            open: true,
        }))
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.release_connection(&self.vhost, self.id);
        debug!(connection = self.id, "memory connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
    id: u64,
    vhost: String,
    connection_closed: Arc<AtomicBool>,
    open: bool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.connection_closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        if !self.open {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }
}

fn check_name(kind: &str, name: &str) -> Result<(), Error> {
    if name.starts_with(RESERVED_PREFIX) {
        return Err(Error::AccessRefused(format!(
            "{} name '{}' uses the reserved prefix '{}'",
            kind, name, RESERVED_PREFIX
        )));
    }
    Ok(())
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(
        &mut self,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(Error::AccessRefused(
                "the default exchange cannot be declared".to_string(),
            ));
        }
        check_name("exchange", name)?;

        let vhost = self.vhost.clone();
        self.broker.with_vhost(&self.vhost, |host| {
            if let Some(existing) = host.exchanges.get(name) {
                if existing.kind != options.kind {
                    return Err(Error::PreconditionFailed(format!(
                        "exchange '{}' in vhost '{}' already declared as {}, not {}",
                        name, vhost, existing.kind, options.kind
                    )));
                }
                return Ok(());
            }
            host.exchanges.insert(
                name.to_string(),
                Exchange {
                    kind: options.kind,
                    bindings: Vec::new(),
                },
            );
            debug!(exchange = name, kind = %options.kind, "exchange declared");
            Ok(())
        })
    }

    async fn declare_queue(
        &mut self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, Error> {
        self.ensure_open()?;
        check_name("queue", name)?;

        let name = if name.is_empty() {
            format!("{}gen-{}", RESERVED_PREFIX, self.broker.next_id())
        } else {
            name.to_string()
        };
        let connection = self.connection;

        self.broker.with_vhost(&self.vhost, |host| {
            if let Some(queue) = host.queues.get(&name) {
                if queue.owner.is_some_and(|owner| owner != connection) {
                    return Err(Error::ResourceLocked(format!(
                        "queue '{}' is exclusive to another connection",
                        name
                    )));
                }
                return Ok(queue.info(&name));
            }

            let queue = Queue {
                owner: options.exclusive.then_some(connection),
                ..Default::default()
            };
            let info = queue.info(&name);
            host.queues.insert(name.clone(), queue);
            debug!(queue = %name, exclusive = options.exclusive, "queue declared");
            Ok(info)
        })
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let vhost = self.vhost.clone();

        self.broker.with_vhost(&self.vhost, |host| {
            if !host.queues.contains_key(queue) {
                return Err(Error::NotFound(format!(
                    "queue '{}' in vhost '{}'",
                    queue, vhost
                )));
            }
            let target = host.exchanges.get_mut(exchange).ok_or_else(|| {
                Error::NotFound(format!("exchange '{}' in vhost '{}'", exchange, vhost))
            })?;

            let exists = target
                .bindings
                .iter()
                .any(|b| b.queue == queue && b.routing_key == routing_key);
            if !exists {
                target.bindings.push(Binding {
                    queue: queue.to_string(),
                    routing_key: routing_key.to_string(),
                });
                debug!(queue, exchange, routing_key, "queue bound");
            }
            Ok(())
        })
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: Publishing,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let vhost = self.vhost.clone();

        self.broker.with_vhost(&self.vhost, |host| {
            let source = host.exchanges.get(exchange).ok_or_else(|| {
                Error::NotFound(format!("exchange '{}' in vhost '{}'", exchange, vhost))
            })?;

            let mut targets: Vec<String> = Vec::new();
            for binding in &source.bindings {
                let matches = match source.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                };
                if matches && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }

            let delivery = Delivery {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                content_type: Some(message.content_type),
                body: message.body,
            };

            trace!(exchange, queues = targets.len(), "routing message");
            for name in targets {
                if let Some(queue) = host.queues.get_mut(&name) {
                    queue.deliver(delivery.clone());
                }
            }
            Ok(())
        })
    }

    async fn consume(&mut self, queue: &str, options: ConsumeOptions) -> Result<Deliveries, Error> {
        self.ensure_open()?;
        if !options.auto_ack {
            return Err(Error::PreconditionFailed(
                "manual acknowledgement is not supported".to_string(),
            ));
        }

        let vhost = self.vhost.clone();
        let tag = self.broker.next_id();
        let (connection, channel) = (self.connection, self.id);

        self.broker.with_vhost(&self.vhost, |host| {
            let target = host.queues.get_mut(queue).ok_or_else(|| {
                Error::NotFound(format!("queue '{}' in vhost '{}'", queue, vhost))
            })?;

            if target.owner.is_some_and(|owner| owner != connection) {
                return Err(Error::ResourceLocked(format!(
                    "queue '{}' is exclusive to another connection",
                    queue
                )));
            }
            let locked = target.consumers.iter().any(|c| c.exclusive)
                || (options.exclusive && !target.consumers.is_empty());
            if locked {
                return Err(Error::ResourceLocked(format!(
                    "queue '{}' has an exclusive consumer",
                    queue
                )));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            // Flush what accumulated before anyone was listening.
            while let Some(delivery) = target.buffer.pop_front() {
                if tx.send(delivery).is_err() {
                    break;
                }
            }
            target.consumers.push(Consumer {
                connection,
                channel,
                exclusive: options.exclusive,
                tx,
            });
            debug!(queue, consumer = tag, "consumer attached");
            Ok(rx)
        })
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.open {
            self.open = false;
            self.broker.release_channel(&self.vhost, self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn connect(broker: &MemoryBroker) -> (Arc<dyn Connection>, Box<dyn Channel>) {
        let conn = broker.dial("memory://test", "/").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        (conn, channel)
    }

    fn text(body: &'static str) -> Publishing {
        Publishing::new("text/plain", Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn test_dial_rejects_foreign_scheme() {
        let broker = MemoryBroker::new();
        let result = broker.dial("tcp://127.0.0.1:5670", "/").await;
        assert!(matches!(result, Err(Error::InvalidDsn(_))));
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let broker = MemoryBroker::new();
        broker.set_refuse_connections(true);
        let result = broker.dial("memory://test", "/").await;
        assert!(matches!(result, Err(Error::ConnectionRefused(_))));
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_bound_queue() {
        let broker = MemoryBroker::new();
        let (_conn, mut ch) = connect(&broker).await;

        ch.declare_exchange("rules", ExchangeOptions::fanout()).await.unwrap();
        for queue in ["q1", "q2"] {
            ch.declare_queue(queue, QueueOptions::default()).await.unwrap();
            ch.bind_queue(queue, "", "rules").await.unwrap();
        }
        let mut d1 = ch.consume("q1", ConsumeOptions::default()).await.unwrap();
        let mut d2 = ch.consume("q2", ConsumeOptions::default()).await.unwrap();

        ch.publish("rules", "ignored", text("hello")).await.unwrap();

        assert_eq!(d1.recv().await.unwrap().body, "hello");
        let delivery = d2.recv().await.unwrap();
        assert_eq!(delivery.body, "hello");
        assert_eq!(delivery.exchange, "rules");
        assert_eq!(delivery.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_direct_routes_by_key() {
        let broker = MemoryBroker::new();
        let (_conn, mut ch) = connect(&broker).await;

        ch.declare_exchange("events", ExchangeOptions::direct()).await.unwrap();
        ch.declare_queue("a", QueueOptions::default()).await.unwrap();
        ch.declare_queue("b", QueueOptions::default()).await.unwrap();
        ch.bind_queue("a", "key-a", "events").await.unwrap();
        ch.bind_queue("b", "key-b", "events").await.unwrap();

        ch.publish("events", "key-a", text("for a")).await.unwrap();

        assert_eq!(broker.queue_info("/", "a").unwrap().messages, 1);
        assert_eq!(broker.queue_info("/", "b").unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_queue_buffers_until_consumed() {
        let broker = MemoryBroker::new();
        let (_conn, mut ch) = connect(&broker).await;

        ch.declare_exchange("rules", ExchangeOptions::fanout()).await.unwrap();
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        ch.bind_queue("q", "", "rules").await.unwrap();

        for body in ["1", "2", "3"] {
            ch.publish("rules", "", text(body)).await.unwrap();
        }
        assert_eq!(broker.queue_info("/", "q").unwrap().messages, 3);

        let mut deliveries = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        for expected in ["1", "2", "3"] {
            assert_eq!(deliveries.recv().await.unwrap().body, expected);
        }
        assert_eq!(broker.queue_info("/", "q").unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_redeclare_exchange_with_other_kind() {
        let broker = MemoryBroker::new();
        let (_conn, mut ch) = connect(&broker).await;

        ch.declare_exchange("rules", ExchangeOptions::direct()).await.unwrap();
        ch.declare_exchange("rules", ExchangeOptions::direct()).await.unwrap();

        let result = ch.declare_exchange("rules", ExchangeOptions::fanout()).await;
        assert!(matches!(result, Err(Error::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_reserved_names() {
        let broker = MemoryBroker::new();
        let (_conn, mut ch) = connect(&broker).await;

        assert!(matches!(
            ch.declare_queue("amq.private", QueueOptions::default()).await,
            Err(Error::AccessRefused(_))
        ));
        assert!(matches!(
            ch.declare_exchange("", ExchangeOptions::fanout()).await,
            Err(Error::AccessRefused(_))
        ));
    }

    #[tokio::test]
    async fn test_generated_queue_name() {
        let broker = MemoryBroker::new();
        let (_conn, mut ch) = connect(&broker).await;

        let info = ch.declare_queue("", QueueOptions::default()).await.unwrap();
        assert!(info.name.starts_with("amq.gen-"));
        assert!(broker.queue_info("/", &info.name).is_some());
    }

    #[tokio::test]
    async fn test_bind_unknown_exchange() {
        let broker = MemoryBroker::new();
        let (_conn, mut ch) = connect(&broker).await;

        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        let result = ch.bind_queue("q", "", "missing").await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        let result = ch.publish("missing", "", text("x")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_exclusive_consumer_locks_queue() {
        let broker = MemoryBroker::new();
        let (_conn, mut ch) = connect(&broker).await;
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();

        let exclusive = ConsumeOptions {
            exclusive: true,
            ..Default::default()
        };
        let _held = ch.consume("q", exclusive).await.unwrap();

        let result = ch.consume("q", ConsumeOptions::default()).await;
        assert!(matches!(result, Err(Error::ResourceLocked(_))));
    }

    #[tokio::test]
    async fn test_exclusive_queue_owned_by_connection() {
        let broker = MemoryBroker::new();
        let (owner, mut ch) = connect(&broker).await;
        let exclusive = QueueOptions {
            exclusive: true,
            ..Default::default()
        };
        ch.declare_queue("private", exclusive).await.unwrap();

        let (_other, mut other_ch) = connect(&broker).await;
        let result = other_ch.declare_queue("private", QueueOptions::default()).await;
        assert!(matches!(result, Err(Error::ResourceLocked(_))));

        owner.close().await.unwrap();
        assert!(broker.queue_info("/", "private").is_none());
    }

    #[tokio::test]
    async fn test_round_robin_consumers() {
        let broker = MemoryBroker::new();
        let (_conn, mut ch) = connect(&broker).await;
        ch.declare_exchange("rules", ExchangeOptions::fanout()).await.unwrap();
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        ch.bind_queue("q", "", "rules").await.unwrap();

        let mut first = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        let mut second = ch.consume("q", ConsumeOptions::default()).await.unwrap();

        for body in ["1", "2", "3", "4"] {
            ch.publish("rules", "", text(body)).await.unwrap();
        }

        assert_eq!(first.recv().await.unwrap().body, "1");
        assert_eq!(second.recv().await.unwrap().body, "2");
        assert_eq!(first.recv().await.unwrap().body, "3");
        assert_eq!(second.recv().await.unwrap().body, "4");
    }

    #[tokio::test]
    async fn test_close_connection_ends_deliveries() {
        let broker = MemoryBroker::new();
        let (conn, mut ch) = connect(&broker).await;
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        let mut deliveries = ch.consume("q", ConsumeOptions::default()).await.unwrap();

        conn.close().await.unwrap();

        assert!(conn.is_closed());
        assert!(deliveries.recv().await.is_none());
        assert!(matches!(
            ch.declare_queue("q2", QueueOptions::default()).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(conn.open_channel().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_channel_cancels_consumers() {
        let broker = MemoryBroker::new();
        let (conn, mut ch) = connect(&broker).await;
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        let mut deliveries = ch.consume("q", ConsumeOptions::default()).await.unwrap();

        ch.close().await.unwrap();

        assert!(deliveries.recv().await.is_none());
        assert!(matches!(
            ch.publish("rules", "", text("x")).await,
            Err(Error::ChannelClosed)
        ));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_vhosts_are_isolated() {
        let broker = MemoryBroker::new();
        let conn = broker.dial("memory://test", "tenant-a").await.unwrap();
        let mut ch = conn.open_channel().await.unwrap();
        ch.declare_exchange("rules", ExchangeOptions::fanout()).await.unwrap();

        assert!(broker.exchange_exists("tenant-a", "rules"));
        assert!(!broker.exchange_exists("/", "rules"));
    }

    #[tokio::test]
    async fn test_dropped_receiver_falls_back_to_buffer() {
        let broker = MemoryBroker::new();
        let (_conn, mut ch) = connect(&broker).await;
        ch.declare_exchange("rules", ExchangeOptions::fanout()).await.unwrap();
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        ch.bind_queue("q", "", "rules").await.unwrap();

        let deliveries = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        drop(deliveries);

        ch.publish("rules", "", text("kept")).await.unwrap();

        let info = broker.queue_info("/", "q").unwrap();
        assert_eq!(info.messages, 1);
        assert_eq!(info.consumers, 0);
    }
}
