//! Node configuration.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use rulesync_proto::Rule;

use crate::error::Error;

/// Default bus DSN (an NNG broker on localhost).
pub const DEFAULT_DSN: &str = "tcp://127.0.0.1:5670";

/// Default virtual host.
pub const DEFAULT_VHOST: &str = "/";

/// Default fanout exchange for rule changes.
pub const DEFAULT_EXCHANGE: &str = "rules";

/// Default capacity of each change-notification queue.
pub const DEFAULT_BUFFER_LIMIT: usize = 128;

/// Role of a node in the replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes its rule changes.
    Master,
    /// Applies changes published by the master.
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Replica => f.write_str("replica"),
        }
    }
}

/// Hub configuration.
///
/// Serialized with the keys `master`, `dsn`, `vHost`, `exchangeName`,
/// `queueName` and `bufferLimit`; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubOptions {
    /// Publish local changes instead of applying remote ones.
    pub master: bool,

    /// Bus connection string.
    pub dsn: String,

    /// Virtual host on the bus.
    #[serde(rename = "vHost")]
    pub vhost: String,

    /// Fanout exchange carrying rule changes.
    pub exchange_name: String,

    /// Queue a replica binds to the exchange. Unused on a master.
    pub queue_name: String,

    /// Capacity of each notification queue; the outbound queue holds twice
    /// as many messages.
    pub buffer_limit: usize,
}

impl HubOptions {
    /// Options for a master publishing on `dsn`.
    pub fn master(dsn: impl Into<String>) -> Self {
        Self {
            master: true,
            dsn: dsn.into(),
            ..Default::default()
        }
    }

    /// Options for a replica consuming `queue` on `dsn`.
    pub fn replica(dsn: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            master: false,
            dsn: dsn.into(),
            queue_name: queue.into(),
            ..Default::default()
        }
    }

    /// Set the virtual host.
    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// Set the exchange name.
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange_name = exchange.into();
        self
    }

    /// Set the queue name.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = queue.into();
        self
    }

    /// Set the notification queue capacity.
    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Role selected by the `master` flag.
    pub fn role(&self) -> Role {
        if self.master {
            Role::Master
        } else {
            Role::Replica
        }
    }

    /// Capacity of the outbound message queue.
    pub fn outbound_limit(&self) -> usize {
        self.buffer_limit.saturating_mul(2)
    }

    /// Check the options before dialing.
    pub fn validate(&self) -> Result<(), Error> {
        if self.dsn.is_empty() {
            return Err(Error::Config("dsn must not be empty".to_string()));
        }
        if self.exchange_name.is_empty() {
            return Err(Error::Config("exchange name must not be empty".to_string()));
        }
        if !self.master && self.queue_name.is_empty() {
            return Err(Error::Config("a replica needs a queue name".to_string()));
        }
        if self.buffer_limit == 0 {
            return Err(Error::Config("buffer limit must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Read options from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            master: false,
            dsn: DEFAULT_DSN.to_string(),
            vhost: DEFAULT_VHOST.to_string(),
            exchange_name: DEFAULT_EXCHANGE.to_string(),
            queue_name: String::new(),
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

/// Read a JSON array of rules.
pub fn load_rules(path: impl AsRef<Path>) -> Result<Vec<Rule>, Error> {
    let raw = std::fs::read(path.as_ref())?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "rulesync-server")]
#[command(version, about = "rulesync rule replication node", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a master or replica node.
    Node(NodeArgs),
    /// Run the NNG forwarding broker.
    Broker(BrokerArgs),
}

/// Arguments of the `node` command. Flags override the config file.
#[derive(clap::Args, Debug, Default)]
pub struct NodeArgs {
    /// JSON config file with hub options.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as master.
    #[arg(long)]
    pub master: bool,

    /// Bus connection string.
    #[arg(long)]
    pub dsn: Option<String>,

    /// Virtual host.
    #[arg(long)]
    pub vhost: Option<String>,

    /// Exchange name.
    #[arg(long)]
    pub exchange: Option<String>,

    /// Queue name (replica only).
    #[arg(long)]
    pub queue: Option<String>,

    /// Notification queue capacity.
    #[arg(long)]
    pub buffer_limit: Option<usize>,

    /// JSON array of rules to load at startup.
    #[arg(long)]
    pub rules: Option<PathBuf>,
}

/// Arguments of the `broker` command.
#[derive(clap::Args, Debug)]
pub struct BrokerArgs {
    /// Base address; egress uses the next port (tcp) or `.out` suffix (ipc).
    #[arg(short, long, default_value = DEFAULT_DSN)]
    pub listen: String,
}

/// Resolved configuration of a node process.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub hub: HubOptions,
    /// Rules to load at startup.
    pub rules_path: Option<PathBuf>,
}

impl NodeArgs {
    /// Merge the config file (if any) with command-line overrides.
    pub fn into_config(self) -> Result<NodeConfig, Error> {
        let mut hub = match &self.config {
            Some(path) => HubOptions::load(path)?,
            None => HubOptions::default(),
        };

        if self.master {
            hub.master = true;
        }
        if let Some(dsn) = self.dsn {
            hub.dsn = dsn;
        }
        if let Some(vhost) = self.vhost {
            hub.vhost = vhost;
        }
        if let Some(exchange) = self.exchange {
            hub.exchange_name = exchange;
        }
        if let Some(queue) = self.queue {
            hub.queue_name = queue;
        }
        if let Some(limit) = self.buffer_limit {
            hub.buffer_limit = limit;
        }

        hub.validate()?;
        Ok(NodeConfig {
            hub,
            rules_path: self.rules,
        })
    }
}
