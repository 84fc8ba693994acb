//! Core engine of the Validana gateway server.
//!
//! Everything in here is transport-agnostic: typed configuration, the
//! pub/sub event hub joining database notifications to subscribers, the
//! TTL cache fronting hot read queries, database access (pool + dedicated
//! `LISTEN` connection), the per-worker metrics aggregator, and the
//! tracing/scrubbing startup glue. The HTTP/WebSocket protocol layer lives
//! in `validana-client-api`, process supervision in `validana-standalone`.

pub mod cache;
pub mod config;
pub mod db;
pub mod hub;
pub mod metrics;
pub mod startup;
pub mod transaction;
pub mod util;

pub use config::Config;
pub use db::Database;
pub use hub::{ConnId, EventHub, TransactionHubs};
