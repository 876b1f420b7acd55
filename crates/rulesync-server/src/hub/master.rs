//! Master pipeline: store notifications to published messages.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use rulesync_bus::Publishing;
use rulesync_core::RuleChangeSource;
use rulesync_proto::{ChangeMessage, MessageType, Rule, CONTENT_TYPE};

use super::{open_exchange, stopped, Pipeline, SetupResult, TaskContext};

/// Register the store listeners and spawn the forwarders and the publisher.
pub(super) fn start(
    context: TaskContext,
    store: &dyn RuleChangeSource,
    ready: SetupResult,
) -> Pipeline {
    let limit = context.options.buffer_limit;
    let (add_tx, add_rx) = mpsc::channel(limit);
    let (del_tx, del_rx) = mpsc::channel(limit);
    let (outbound_tx, outbound_rx) = mpsc::channel(context.options.outbound_limit());

    let listeners = vec![store.on_add(add_tx), store.on_del(del_tx)];

    let tasks = vec![
        tokio::spawn(forward(
            MessageType::Add,
            add_rx,
            outbound_tx.clone(),
            context.shutdown.clone(),
        )),
        tokio::spawn(forward(
            MessageType::Delete,
            del_rx,
            outbound_tx,
            context.shutdown.clone(),
        )),
        tokio::spawn(publish(context, outbound_rx, ready)),
    ];

    Pipeline { tasks, listeners }
}

/// Wrap each notified rule into a message of `kind` and queue it for
/// publishing, in arrival order.
async fn forward(
    kind: MessageType,
    mut notifications: mpsc::Receiver<Rule>,
    outbound: mpsc::Sender<ChangeMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let rule = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            rule = notifications.recv() => match rule {
                Some(rule) => rule,
                None => break,
            },
        };

        let message = ChangeMessage::new(kind, rule);
        let sent = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            sent = outbound.send(message) => sent,
        };
        if sent.is_err() {
            break;
        }
    }
    debug!(kind = %kind, "forwarder stopped");
}

/// Declare the exchange, then publish queued messages until stopped.
async fn publish(
    context: TaskContext,
    mut outbound: mpsc::Receiver<ChangeMessage>,
    ready: SetupResult,
) {
    let TaskContext {
        options,
        connection,
        mut shutdown,
        stats,
    } = context;
    let exchange = options.exchange_name.as_str();

    let mut channel = match open_exchange(connection.as_ref(), exchange).await {
        Ok(channel) => channel,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!(exchange, "publisher ready");

    loop {
        let message = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let body = match message.encode() {
            Ok(body) => body,
            Err(e) => {
                stats.record_encode_failure();
                warn!(rule = %message.rule.id, error = %e, "failed to encode rule message");
                continue;
            }
        };

        let result = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            result = channel.publish(exchange, "", Publishing::new(CONTENT_TYPE, body)) => result,
        };

        match result {
            Ok(()) => {
                stats.record_published();
                info!(kind = %message.kind, rule = %message.rule.id, "sending rule message");
            }
            Err(e) if e.is_connection_closed() => {
                debug!("bus connection closed");
                break;
            }
            Err(e) => {
                stats.record_publish_failure();
                warn!(
                    kind = %message.kind,
                    rule = %message.rule.id,
                    error = %e,
                    "failed to publish rule message"
                );
            }
        }
    }

    let _ = channel.close().await;
    debug!(exchange, "publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_forward_wraps_in_order() {
        let (notify_tx, notify_rx) = mpsc::channel(4);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let (_shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(forward(MessageType::Delete, notify_rx, outbound_tx, shutdown_rx));

        notify_tx.send(Rule::new("r1", "")).await.unwrap();
        notify_tx.send(Rule::new("r2", "")).await.unwrap();
        drop(notify_tx);

        let first = outbound_rx.recv().await.unwrap();
        let second = outbound_rx.recv().await.unwrap();
        assert_eq!(first, ChangeMessage::delete(Rule::new("r1", "")));
        assert_eq!(second, ChangeMessage::delete(Rule::new("r2", "")));

        // Closing the notification queue ends the forwarder.
        task.await.unwrap();
        assert!(outbound_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_forward_blocks_on_full_outbound() {
        let (notify_tx, notify_rx) = mpsc::channel(4);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(1);
        let (_shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(forward(MessageType::Add, notify_rx, outbound_tx, shutdown_rx));

        for id in ["r1", "r2", "r3"] {
            notify_tx.send(Rule::new(id, "")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One message fits the outbound queue, one is held by the forwarder.
        assert_eq!(notify_tx.capacity(), 3);

        for id in ["r1", "r2", "r3"] {
            assert_eq!(outbound_rx.recv().await.unwrap().rule.id, id);
        }
    }

    #[tokio::test]
    async fn test_forward_stops_on_shutdown() {
        let (_notify_tx, notify_rx) = mpsc::channel::<Rule>(4);
        let (outbound_tx, _outbound_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(forward(MessageType::Add, notify_rx, outbound_tx, shutdown_rx));
        shutdown.send_replace(true);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("forwarder should stop")
            .unwrap();
    }
}
