//! Rule replication hub.
//!
//! A hub connects a node's rule store to the bus. On a master it listens for
//! local changes and publishes them to a fanout exchange; on a replica it
//! consumes that exchange through its own queue and applies each change to
//! the local store.
//!
//! ```text
//! master:  RuleStore --on_add/on_del--> forwarders --outbound--> publisher --> exchange
//! replica: exchange --> queue --> consumer --put/delete--> RuleStore
//! ```
//!
//! Construction waits for the background task to finish its bus setup, so a
//! hub that was returned is known to be publishing or consuming.

mod master;
mod replica;

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rulesync_bus::{Channel, Connection, ExchangeOptions, Transport};
use rulesync_core::{ListenerId, RuleChangeSource};

use crate::config::{HubOptions, Role};
use crate::error::Error;
use crate::stats::HubStats;

/// One-shot report of the setup step.
type SetupResult = oneshot::Sender<Result<(), Error>>;

/// State handed to every background task.
#[derive(Clone)]
struct TaskContext {
    options: Arc<HubOptions>,
    connection: Arc<dyn Connection>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<HubStats>,
}

/// Tasks and listener registrations created for one role.
struct Pipeline {
    tasks: Vec<JoinHandle<()>>,
    listeners: Vec<ListenerId>,
}

/// Resolves once the hub asks its tasks to stop (or the hub is gone).
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Open a channel and declare the rule exchange on it.
async fn open_exchange(
    connection: &dyn Connection,
    exchange: &str,
) -> Result<Box<dyn Channel>, Error> {
    let mut channel = connection.open_channel().await.map_err(Error::OpenChannel)?;

    if let Err(source) = channel
        .declare_exchange(exchange, ExchangeOptions::fanout())
        .await
    {
        let _ = channel.close().await;
        return Err(Error::DeclareExchange {
            exchange: exchange.to_string(),
            source,
        });
    }

    Ok(channel)
}

/// A running replication hub.
///
/// Use [`Hub::close`] to stop it. Dropping a hub stops its tasks and
/// deregisters its listeners but leaves the connection to be released by
/// the transport.
pub struct Hub {
    role: Role,
    options: Arc<HubOptions>,
    connection: Arc<dyn Connection>,
    store: Arc<dyn RuleChangeSource>,
    listeners: Vec<ListenerId>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<HubStats>,
}

impl Hub {
    /// Dial the bus and start the pipeline for the configured role.
    ///
    /// Returns once the exchange is declared (and, on a replica, the queue
    /// is bound and consumed). Any failure up to that point closes the
    /// connection and is returned; nothing keeps running.
    pub async fn new(
        options: HubOptions,
        store: Arc<dyn RuleChangeSource>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        options.validate()?;
        let role = options.role();

        let connection = transport
            .dial(&options.dsn, &options.vhost)
            .await
            .map_err(|source| Error::Dial {
                dsn: options.dsn.clone(),
                source,
            })?;

        info!(
            role = %role,
            dsn = %options.dsn,
            vhost = %options.vhost,
            exchange = %options.exchange_name,
            "connected to bus"
        );

        let options = Arc::new(options);
        let stats = Arc::new(HubStats::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let context = TaskContext {
            options: options.clone(),
            connection: connection.clone(),
            shutdown: shutdown_rx,
            stats: stats.clone(),
        };

        let pipeline = match role {
            Role::Master => master::start(context, store.as_ref(), ready_tx),
            Role::Replica => replica::start(context, store.clone(), ready_tx),
        };

        let mut hub = Self {
            role,
            options,
            connection,
            store,
            listeners: pipeline.listeners,
            shutdown,
            tasks: pipeline.tasks,
            stats,
        };

        let setup = ready_rx.await.unwrap_or(Err(Error::SetupAborted));
        if let Err(e) = setup {
            warn!(role = %role, error = %e, "hub setup failed");
            hub.shutdown().await;
            return Err(e);
        }

        info!(role = %role, "hub started");
        Ok(hub)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    /// Live counters of the hub's tasks.
    pub fn stats(&self) -> &HubStats {
        &self.stats
    }

    /// Stop the hub and release the bus connection.
    ///
    /// Messages still queued inside the hub are discarded.
    pub async fn close(mut self) {
        self.shutdown().await;

        let stats = self.stats.snapshot();
        info!(
            role = %self.role,
            uptime_secs = self.stats.uptime().as_secs(),
            published = stats.published,
            publish_failures = stats.publish_failures,
            encode_failures = stats.encode_failures,
            received = stats.received,
            dropped = stats.dropped,
            adds_applied = stats.adds_applied,
            deletes_applied = stats.deletes_applied,
            "hub closed"
        );
    }

    async fn shutdown(&mut self) {
        self.shutdown.send_replace(true);
        self.release_listeners();

        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "failed to close bus connection");
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "hub task failed");
            }
        }
        debug!(role = %self.role, "hub tasks stopped");
    }

    fn release_listeners(&mut self) {
        for id in self.listeners.drain(..) {
            self.store.remove_listener(id);
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.release_listeners();
    }
}
