//! Every SQL statement the gateway issues, in one place.

use thiserror::Error;
use tokio_postgres::error::SqlState;
use tokio_postgres::GenericClient;

use super::{Contract, TransactionInfo};
use crate::transaction::SignedTransaction;

#[derive(Error, Debug)]
pub enum InsertTxError {
    #[error("Transaction with id already exists.")]
    Duplicate,
    #[error(transparent)]
    Db(#[from] tokio_postgres::Error),
}

/// Insert a freshly submitted transaction with `status = new`. The processor
/// picks it up from there.
pub async fn insert_transaction<C: GenericClient>(
    client: &C,
    tx: &SignedTransaction,
    create_ts: i64,
) -> Result<(), InsertTxError> {
    let result = client
        .execute(
            "INSERT INTO basics.transactions \
             (version, transaction_id, contract_hash, valid_till, payload, signature, public_key, status, create_ts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'new', $8)",
            &[
                &(tx.version as i16),
                &tx.id.as_slice(),
                &tx.contract_hash.as_slice(),
                &tx.valid_till,
                &tx.payload,
                &tx.signature.as_slice(),
                &tx.public_key.as_slice(),
                &create_ts,
            ],
        )
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => Err(InsertTxError::Duplicate),
        Err(e) => Err(e.into()),
    }
}

pub async fn transactions_by_ids<C: GenericClient>(
    client: &C,
    ids: &[Vec<u8>],
) -> Result<Vec<TransactionInfo>, tokio_postgres::Error> {
    let rows = client
        .query(
            "SELECT * FROM basics.transactions WHERE transaction_id = ANY($1)",
            &[&ids],
        )
        .await?;
    rows.iter().map(TransactionInfo::from_row).collect()
}

/// All transactions the processor stamped with exactly this timestamp,
/// the set a `blocks` notification refers to.
pub async fn transactions_processed_at<C: GenericClient>(
    client: &C,
    processed_ts: i64,
) -> Result<Vec<TransactionInfo>, tokio_postgres::Error> {
    let rows = client
        .query(
            "SELECT * FROM basics.transactions WHERE processed_ts = $1",
            &[&processed_ts],
        )
        .await?;
    rows.iter().map(TransactionInfo::from_row).collect()
}

pub async fn latest_block_ts<C: GenericClient>(
    client: &C,
) -> Result<Option<i64>, tokio_postgres::Error> {
    let row = client
        .query_opt(
            "SELECT processed_ts FROM basics.blocks ORDER BY block_id DESC LIMIT 1",
            &[],
        )
        .await?;
    row.map(|r| r.try_get(0)).transpose()
}

pub async fn contracts<C: GenericClient>(
    client: &C,
) -> Result<Vec<Contract>, tokio_postgres::Error> {
    let rows = client
        .query(
            "SELECT contract_hash, contract_type, contract_version, description, \
             contract_template, validana_version FROM basics.contracts",
            &[],
        )
        .await?;
    rows.iter().map(Contract::from_row).collect()
}

// Metrics persistence. Totals accumulate into the shared `worker = -1` row;
// currents overwrite the worker's own row.

pub async fn upsert_total_metric<C: GenericClient>(
    client: &C,
    metric: &str,
    value: i64,
) -> Result<(), tokio_postgres::Error> {
    client
        .execute(
            "INSERT INTO basics.metrics (metric, worker, value) VALUES ($1, -1, $2) \
             ON CONFLICT (metric, worker) DO UPDATE SET value = basics.metrics.value + EXCLUDED.value",
            &[&metric, &value],
        )
        .await?;
    Ok(())
}

pub async fn upsert_current_metric<C: GenericClient>(
    client: &C,
    metric: &str,
    worker: i32,
    value: i64,
) -> Result<(), tokio_postgres::Error> {
    client
        .execute(
            "INSERT INTO basics.metrics (metric, worker, value) VALUES ($1, $2, $3) \
             ON CONFLICT (metric, worker) DO UPDATE SET value = EXCLUDED.value",
            &[&metric, &worker, &value],
        )
        .await?;
    Ok(())
}

/// Drop current-metric rows of worker ids outside the running deployment.
/// A worker that died leaves its last gauges behind; totals are unaffected.
pub async fn delete_stale_metric_rows<C: GenericClient>(
    client: &C,
    worker_count: i32,
) -> Result<u64, tokio_postgres::Error> {
    client
        .execute(
            "DELETE FROM basics.metrics WHERE worker <> -1 AND (worker < 0 OR worker >= $1)",
            &[&worker_count],
        )
        .await
}

pub async fn export_total_metrics<C: GenericClient>(
    client: &C,
) -> Result<Vec<(String, i64)>, tokio_postgres::Error> {
    let rows = client
        .query(
            "SELECT metric, value FROM basics.metrics WHERE worker = -1 ORDER BY metric",
            &[],
        )
        .await?;
    rows.iter()
        .map(|r| Ok((r.try_get(0)?, r.try_get(1)?)))
        .collect()
}

/// Current metrics, one JSON array of per-worker values per metric.
pub async fn export_current_metrics<C: GenericClient>(
    client: &C,
) -> Result<Vec<(String, serde_json::Value)>, tokio_postgres::Error> {
    let rows = client
        .query(
            "SELECT metric, jsonb_agg(value ORDER BY worker) FROM basics.metrics \
             WHERE worker <> -1 GROUP BY metric ORDER BY metric",
            &[],
        )
        .await?;
    rows.iter()
        .map(|r| Ok((r.try_get(0)?, r.try_get(1)?)))
        .collect()
}
