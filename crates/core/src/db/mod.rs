//! Database access: the shared connection pool and the row models the
//! gateway reads and writes. The schema itself belongs to the processor;
//! the gateway only inserts new transactions and reads processed state.

pub mod listener;
pub mod queries;

use anyhow::Context;
use deadpool_postgres::{ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde::Serialize;
use tokio_postgres::{NoTls, Row};

use crate::config::Config;

/// Lifecycle states of a persisted transaction. The gateway writes `New`;
/// the processor owns every later transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    New,
    Invalid,
    Accepted,
    Rejected,
}

impl TxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::New => "new",
            TxStatus::Invalid => "invalid",
            TxStatus::Accepted => "accepted",
            TxStatus::Rejected => "rejected",
        }
    }

    fn from_db(value: &str) -> TxStatus {
        match value {
            "invalid" => TxStatus::Invalid,
            "accepted" => TxStatus::Accepted,
            "rejected" => TxStatus::Rejected,
            _ => TxStatus::New,
        }
    }
}

/// One row of `basics.transactions`, shaped for JSON responses: byte
/// columns are hex-encoded strings.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub id: String,
    pub version: i16,
    pub contract_hash: String,
    pub valid_till: i64,
    pub payload: String,
    pub signature: String,
    pub public_key: String,
    pub create_ts: i64,
    pub block_id: Option<i64>,
    pub position_in_block: Option<i32>,
    pub processed_ts: Option<i64>,
    pub status: TxStatus,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub contract_type: Option<String>,
    pub message: Option<String>,
}

impl TransactionInfo {
    pub fn from_row(row: &Row) -> Result<TransactionInfo, tokio_postgres::Error> {
        Ok(TransactionInfo {
            id: hex::encode(row.try_get::<_, Vec<u8>>("transaction_id")?),
            version: row.try_get("version")?,
            contract_hash: hex::encode(row.try_get::<_, Vec<u8>>("contract_hash")?),
            valid_till: row.try_get("valid_till")?,
            payload: row.try_get("payload")?,
            signature: hex::encode(row.try_get::<_, Vec<u8>>("signature")?),
            public_key: hex::encode(row.try_get::<_, Vec<u8>>("public_key")?),
            create_ts: row.try_get("create_ts")?,
            block_id: row.try_get("block_id")?,
            position_in_block: row.try_get("position_in_block")?,
            processed_ts: row.try_get("processed_ts")?,
            status: TxStatus::from_db(row.try_get("status")?),
            sender: row.try_get("sender")?,
            receiver: row.try_get("receiver")?,
            contract_type: row.try_get("contract_type")?,
            message: row.try_get("message")?,
        })
    }

    /// Processed means the processor has recorded an outcome, good or bad.
    pub fn is_processed(&self) -> bool {
        self.processed_ts.is_some()
    }
}

/// One row of `basics.contracts`, as served by the `contracts` verb.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub hash: String,
    #[serde(rename = "type")]
    pub contract_type: String,
    pub version: String,
    pub description: String,
    pub template: serde_json::Value,
    pub validana_version: i32,
}

impl Contract {
    pub fn from_row(row: &Row) -> Result<Contract, tokio_postgres::Error> {
        Ok(Contract {
            hash: hex::encode(row.try_get::<_, Vec<u8>>("contract_hash")?),
            contract_type: row.try_get("contract_type")?,
            version: row.try_get("contract_version")?,
            description: row.try_get("description")?,
            template: row.try_get("contract_template")?,
            validana_version: row.try_get("validana_version")?,
        })
    }
}

/// The worker's single shared I/O resource: a lazily-connecting pool.
/// Multi-statement units take a dedicated client and run inside an explicit
/// transaction; the notification listener connects outside the pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
}

impl Database {
    pub fn new(config: &Config) -> anyhow::Result<Database> {
        let mut pool_config = deadpool_postgres::Config::new();
        pool_config.host = Some(config.db_host.clone());
        pool_config.port = Some(config.db_port);
        pool_config.user = Some(config.db_user.clone());
        pool_config.password = Some(config.db_password.clone());
        pool_config.dbname = Some(config.db_name.clone());
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pool_config.pool = Some(deadpool_postgres::PoolConfig::new(
            config.db_max_connections as usize,
        ));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("failed to set up database pool")?;
        Ok(Database { pool })
    }

    /// Verify the database is reachable. Called once at worker start so a
    /// misconfigured deployment fails before the first request does.
    pub async fn check(&self) -> anyhow::Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await.context("database check query failed")?;
        Ok(())
    }

    pub async fn client(&self) -> anyhow::Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .context("failed to acquire database connection")
    }

    /// Close the pool. In-flight clients finish; new acquisitions fail.
    pub fn close(&self) {
        self.pool.close();
    }
}
