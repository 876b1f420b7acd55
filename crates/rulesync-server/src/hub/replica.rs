//! Replica pipeline: consumed messages applied to the local store.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use rulesync_bus::{Channel, ConsumeOptions, Connection, Deliveries, QueueOptions};
use rulesync_core::RuleChangeSource;
use rulesync_proto::{ChangeMessage, MessageType};

use super::{open_exchange, stopped, Pipeline, SetupResult, TaskContext};
use crate::config::HubOptions;
use crate::error::Error;
use crate::stats::HubStats;

/// Spawn the consumer task.
pub(super) fn start(
    context: TaskContext,
    store: Arc<dyn RuleChangeSource>,
    ready: SetupResult,
) -> Pipeline {
    Pipeline {
        tasks: vec![tokio::spawn(consume(context, store, ready))],
        listeners: Vec::new(),
    }
}

/// Declare the exchange and queue, bind them and start consuming.
async fn subscribe(
    connection: &dyn Connection,
    options: &HubOptions,
) -> Result<(Box<dyn Channel>, Deliveries), Error> {
    let mut channel = open_exchange(connection, &options.exchange_name).await?;

    match bind_and_consume(&mut *channel, options).await {
        Ok(deliveries) => Ok((channel, deliveries)),
        Err(e) => {
            let _ = channel.close().await;
            Err(e)
        }
    }
}

async fn bind_and_consume(
    channel: &mut dyn Channel,
    options: &HubOptions,
) -> Result<Deliveries, Error> {
    let queue = channel
        .declare_queue(&options.queue_name, QueueOptions::default())
        .await
        .map_err(|source| Error::DeclareQueue {
            queue: options.queue_name.clone(),
            source,
        })?;

    channel
        .bind_queue(&queue.name, "", &options.exchange_name)
        .await
        .map_err(|source| Error::BindQueue {
            queue: queue.name.clone(),
            exchange: options.exchange_name.clone(),
            source,
        })?;

    channel
        .consume(&queue.name, ConsumeOptions::default())
        .await
        .map_err(|source| Error::Consume {
            queue: queue.name.clone(),
            source,
        })
}

async fn consume(context: TaskContext, store: Arc<dyn RuleChangeSource>, ready: SetupResult) {
    let TaskContext {
        options,
        connection,
        mut shutdown,
        stats,
    } = context;

    let (mut channel, mut deliveries) = match subscribe(connection.as_ref(), &options).await {
        Ok(subscribed) => subscribed,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!(
        exchange = %options.exchange_name,
        queue = %options.queue_name,
        "consuming rule changes"
    );

    loop {
        let delivery = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => {
                    debug!("delivery stream ended");
                    break;
                }
            },
        };
        stats.record_received();

        let message = match ChangeMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                stats.record_dropped();
                warn!(bytes = delivery.body.len(), error = %e, "dropping rule message");
                continue;
            }
        };

        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = apply(store.as_ref(), message, &stats) => {}
        }
    }

    let _ = channel.close().await;
    debug!(queue = %options.queue_name, "consumer stopped");
}

/// Apply one change to the store.
async fn apply(store: &dyn RuleChangeSource, message: ChangeMessage, stats: &HubStats) {
    let ChangeMessage { kind, rule } = message;
    match kind {
        MessageType::Add => {
            info!(rule = %rule.id, "applying rule add");
            store.put(rule).await;
            stats.record_add();
        }
        MessageType::Delete => {
            info!(rule = %rule.id, "applying rule delete");
            if store.delete(&rule.id).await.is_none() {
                trace!(rule = %rule.id, "rule was not present");
            }
            stats.record_delete();
        }
    }
}
