//! rulesync server - rule replication node and NNG broker.

use std::sync::Arc;

use clap::Parser;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rulesync_bus::{create_transport, NngBroker};
use rulesync_core::{RuleChangeSource, RuleStore};
use rulesync_server::config::{self, BrokerArgs, Command, NodeArgs};
use rulesync_server::{console, Args, Hub, Role};

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "rulesync_server=info,rulesync_bus=info,rulesync_core=info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting rulesync server");

    let args = Args::parse();
    match args.command {
        Command::Node(node) => run_node(node).await,
        Command::Broker(broker) => run_broker(broker).await,
    }
}

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config()?;
    tracing::info!(
        role = %config.hub.role(),
        dsn = %config.hub.dsn,
        vhost = %config.hub.vhost,
        exchange = %config.hub.exchange_name,
        queue = %config.hub.queue_name,
        "configuration loaded"
    );

    let store = Arc::new(RuleStore::new());
    let transport = create_transport(&config.hub.dsn)?;
    let hub = Hub::new(config.hub.clone(), store.clone(), transport).await?;

    if let Some(path) = &config.rules_path {
        let rules = config::load_rules(path)?;
        tracing::info!(count = rules.len(), path = %path.display(), "loading rules");
        for rule in rules {
            store.put(rule).await;
        }
    }

    if hub.role() == Role::Master {
        let store = store.clone();
        tokio::spawn(async move {
            let input = BufReader::new(tokio::io::stdin());
            if let Err(e) = console::run_console(input, tokio::io::stdout(), store).await {
                tracing::error!(error = %e, "console failed");
            }
        });
    }

    tracing::info!(rules = store.len(), "node ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("received shutdown signal");

    hub.close().await;
    tracing::info!("node shutdown complete");
    Ok(())
}

async fn run_broker(args: BrokerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let broker = NngBroker::bind(&args.listen)?.spawn()?;
    tracing::info!(
        ingress = %broker.addresses().ingress,
        egress = %broker.addresses().egress,
        "broker ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("received shutdown signal");

    let forwarded = broker.forwarded();
    tokio::task::spawn_blocking(move || broker.stop()).await?;
    tracing::info!(forwarded, "broker shutdown complete");
    Ok(())
}
