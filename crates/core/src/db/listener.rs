//! The `LISTEN blocks` subscriber.
//!
//! Runs on a dedicated connection outside the pool so a saturated pool can
//! never starve notification delivery. Each payload names the processing
//! timestamp of a finished block; if anyone is subscribed, the matching
//! transaction rows are fetched through the pool and fanned into the hubs.
//! A lost connection is replaced after five seconds.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, NoTls};
use tokio_util::sync::CancellationToken;

use super::{queries, Database};
use crate::config::Config;
use crate::hub::TransactionHubs;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Payload of a `blocks` notification.
#[derive(Debug, Deserialize)]
struct BlockNotification {
    ts: i64,
    #[serde(default)]
    txs: i64,
    #[serde(default)]
    other: i64,
    #[serde(default)]
    #[allow(dead_code)]
    block: Option<i64>,
}

impl BlockNotification {
    fn has_work(&self) -> bool {
        self.txs > 0 || self.other != 0
    }
}

pub fn spawn(
    config: Arc<Config>,
    db: Database,
    hubs: Arc<TransactionHubs>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(config, db, hubs, shutdown))
}

async fn run(
    config: Arc<Config>,
    db: Database,
    hubs: Arc<TransactionHubs>,
    shutdown: CancellationToken,
) {
    loop {
        if let Err(e) = listen_once(&config, &db, &hubs, &shutdown).await {
            tracing::warn!("notification listener lost its connection: {e:#}");
        }
        if shutdown.is_cancelled() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Connect, `LISTEN blocks`, and pump notifications until the connection
/// ends or shutdown is requested. Returns `Ok` only on shutdown.
async fn listen_once(
    config: &Config,
    db: &Database,
    hubs: &TransactionHubs,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let (client, mut connection) =
        tokio_postgres::connect(&config.db_connection_string(), NoTls).await?;

    // The connection only makes progress while polled; drive it on its own
    // task and forward notifications over a channel.
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let driver = tokio::spawn(async move {
        let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(n)) => {
                    if notify_tx.send(n).is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("notification connection error: {e}");
                    return;
                }
            }
        }
    });
    let _abort_driver = scopeguard::guard((), |()| driver.abort());

    client.batch_execute("LISTEN blocks").await?;
    tracing::debug!("listening for block notifications");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            notification = notify_rx.recv() => {
                let Some(notification) = notification else {
                    anyhow::bail!("notification stream ended");
                };
                if notification.channel() != "blocks" {
                    continue;
                }
                if let Err(e) = handle_notification(db, hubs, notification.payload()).await {
                    tracing::error!("failed to process block notification: {e:#}");
                }
            }
        }
    }
}

async fn handle_notification(
    db: &Database,
    hubs: &TransactionHubs,
    payload: &str,
) -> anyhow::Result<()> {
    let notification: BlockNotification = serde_json::from_str(payload)
        .map_err(|e| anyhow::anyhow!("malformed blocks payload `{payload}`: {e}"))?;

    // Skip the row fetch entirely when nobody is listening or the block
    // carried nothing relevant.
    if !notification.has_work() || !hubs.has_any_subscribers() {
        return Ok(());
    }

    let client = db.client().await?;
    let transactions = queries::transactions_processed_at(&**client, notification.ts).await?;
    drop(client);

    tracing::debug!(
        count = transactions.len(),
        ts = notification.ts,
        "fanning out processed transactions"
    );
    for tx in &transactions {
        hubs.emit(tx);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn payload_parses_with_optional_fields() {
        let n: BlockNotification = serde_json::from_str(r#"{"ts": 17, "txs": 3, "other": 0}"#).unwrap();
        assert_eq!(n.ts, 17);
        assert!(n.has_work());

        let n: BlockNotification = serde_json::from_str(r#"{"ts": 17}"#).unwrap();
        assert!(!n.has_work());

        let n: BlockNotification =
            serde_json::from_str(r#"{"ts": 17, "other": 2, "block": 9}"#).unwrap();
        assert!(n.has_work());
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(serde_json::from_str::<BlockNotification>("not json").is_err());
    }
}
