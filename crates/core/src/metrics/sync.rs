//! Periodic persistence of worker metrics into `basics.metrics`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Metrics;
use crate::config::Config;
use crate::db::{queries, Database};
use crate::util;

pub fn spawn(
    config: Arc<Config>,
    db: Database,
    metrics: Arc<Metrics>,
    worker_id: i32,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if config.metrics_interval == 0 {
        return None;
    }
    Some(tokio::spawn(run(config, db, metrics, worker_id, shutdown)))
}

async fn run(
    config: Arc<Config>,
    db: Database,
    metrics: Arc<Metrics>,
    worker_id: i32,
    shutdown: CancellationToken,
) {
    let period = Duration::from_secs(config.metrics_interval);
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // the zeroth tick fires immediately
    let mut cleaned_stale_rows = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        match sync_once(&db, &metrics, worker_id).await {
            Ok(()) => {
                if !cleaned_stale_rows {
                    // A previous, larger deployment may have left gauges of
                    // worker ids that no longer exist.
                    let workers = config.resolved_workers() as i32;
                    match cleanup_stale_rows(&db, workers).await {
                        Ok(removed) if removed > 0 => {
                            tracing::info!(removed, "removed stale metric rows")
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("failed to remove stale metric rows: {e:#}"),
                    }
                    cleaned_stale_rows = true;
                }
            }
            Err(e) => tracing::warn!("metrics sync failed: {e:#}"),
        }
    }
}

/// Persist one round of metrics atomically: totals into the shared
/// `worker = -1` row, currents under this worker's id. Local totals are
/// only reduced once the transaction commits.
async fn sync_once(db: &Database, metrics: &Metrics, worker_id: i32) -> anyhow::Result<()> {
    metrics.set_memory_mb(util::resident_memory_mb() as i64);
    let now_ms = util::now_millis();
    let snapshot = metrics.totals_snapshot();

    let mut client = db.client().await?;
    let tx = client.transaction().await?;
    for (name, value) in &snapshot {
        queries::upsert_total_metric(&*tx, name, *value).await?;
    }
    for (name, value) in metrics.currents() {
        let value = if name == "lastSync" { now_ms } else { value };
        queries::upsert_current_metric(&*tx, &name, worker_id, value).await?;
    }
    tx.commit().await?;

    metrics.subtract_totals(&snapshot);
    metrics.mark_synced(now_ms);
    Ok(())
}

async fn cleanup_stale_rows(db: &Database, worker_count: i32) -> anyhow::Result<u64> {
    let client = db.client().await?;
    Ok(queries::delete_stale_metric_rows(&**client, worker_count).await?)
}
