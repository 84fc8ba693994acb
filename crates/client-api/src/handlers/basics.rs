//! The built-in verb bundle: transaction submission and queries, contract
//! listings, chain time, and metrics export.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use validana_core::cache::Cache;
use validana_core::config::Config;
use validana_core::db::{queries, Database, TransactionInfo, TxStatus};
use validana_core::hub::{ConnId, TransactionHubs};
use validana_core::metrics::export::{ExportError, MetricsExporter};
use validana_core::transaction::SignedTransaction;
use validana_core::util;

use crate::dispatcher::{Dispatcher, HandlerResult};
use crate::errors::RequestError;
use crate::message::RequestContext;

const LATEST_BLOCK_TTL: Duration = Duration::from_secs(5);
const CONTRACTS_TTL: Duration = Duration::from_secs(60);

/// Wait/push subscriptions are keyed like connections in the hubs; ids from
/// the top half of the space can never collide with transport connections.
static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1 << 63);

fn waiter_id() -> ConnId {
    NEXT_WAITER_ID.fetch_add(1, Relaxed)
}

/// Dependencies of the basics bundle.
pub struct Basics {
    pub config: Arc<Config>,
    pub db: Database,
    pub hubs: Arc<TransactionHubs>,
    pub cache: Arc<Cache>,
    pub exporter: Arc<MetricsExporter>,
}

impl Basics {
    /// Register the bundle's verbs and cache entries under `version`.
    pub fn register(self, dispatcher: &mut Dispatcher, version: &str) {
        let state = Arc::new(self);

        let db = state.db.clone();
        state.cache.add("latestBlock", LATEST_BLOCK_TTL, move |_key| {
            let db = db.clone();
            Box::pin(async move {
                let client = db.client().await?;
                let ts = queries::latest_block_ts(&**client).await?;
                Ok(ts.map(|ts| json!(ts)).unwrap_or(Value::Null))
            })
        });

        let db = state.db.clone();
        state.cache.add("contracts", CONTRACTS_TTL, move |_key| {
            let db = db.clone();
            Box::pin(async move {
                let client = db.client().await?;
                let contracts = queries::contracts(&**client).await?;
                Ok(serde_json::to_value(contracts)?)
            })
        });

        let st = state.clone();
        dispatcher.register(version, "time", true, move |_ctx, _data| {
            let st = st.clone();
            Box::pin(async move { time(st).await })
        });

        let st = state.clone();
        dispatcher.register(version, "contracts", true, move |_ctx, data| {
            let st = st.clone();
            Box::pin(async move { contracts(st, data).await })
        });

        let st = state.clone();
        dispatcher.register(version, "process", true, move |ctx, data| {
            let st = st.clone();
            Box::pin(async move { process(st, ctx, data).await })
        });

        let st = state.clone();
        dispatcher.register(version, "txstatus", true, move |ctx, data| {
            let st = st.clone();
            Box::pin(async move { tx_lookup(st, ctx, data, false).await })
        });

        let st = state.clone();
        dispatcher.register(version, "transaction", true, move |ctx, data| {
            let st = st.clone();
            Box::pin(async move { tx_lookup(st, ctx, data, true).await })
        });

        let st = state.clone();
        dispatcher.register(version, "metrics", false, move |ctx, data| {
            let st = st.clone();
            Box::pin(async move { metrics(st, ctx, data).await })
        });
    }
}

async fn time(st: Arc<Basics>) -> HandlerResult {
    let value = st.cache.get("latestBlock").await?;
    if value.is_null() {
        return Err(RequestError::client("No existing blocks found."));
    }
    Ok(value)
}

async fn contracts(st: Arc<Basics>, data: Value) -> HandlerResult {
    let type_filter = parse_contract_filter(data)?;
    let all = st.cache.get("contracts").await?;
    let Some(list) = all.as_array() else {
        return Err(RequestError::server(anyhow::anyhow!(
            "contract cache holds a non-array value"
        )));
    };
    let filtered: Vec<Value> = match &type_filter {
        None => list.clone(),
        Some(wanted) => list
            .iter()
            .filter(|c| c.get("type").and_then(Value::as_str) == Some(wanted.as_str()))
            .cloned()
            .collect(),
    };
    Ok(Value::Array(filtered))
}

fn parse_contract_filter(data: Value) -> Result<Option<String>, RequestError> {
    match data {
        Value::Null => Ok(None),
        Value::String(filter) => Ok(Some(filter)),
        Value::Object(map) => match map.get("type") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(filter)) => Ok(Some(filter.clone())),
            Some(_) => Err(RequestError::client("Invalid format for type.")),
        },
        _ => Err(RequestError::client("Invalid format for contracts request.")),
    }
}

#[derive(Deserialize)]
struct ProcessRequest {
    base64tx: String,
    #[serde(rename = "createTs")]
    create_ts: Option<i64>,
    #[serde(default)]
    wait: bool,
}

async fn process(st: Arc<Basics>, ctx: Arc<RequestContext>, data: Value) -> HandlerResult {
    let request: ProcessRequest = serde_json::from_value(data)
        .map_err(|_| RequestError::client("Invalid format for process request."))?;
    let tx = SignedTransaction::from_base64(&request.base64tx)
        .map_err(|e| RequestError::client(e.to_string()))?;

    // Subscribe before inserting, so a processor racing us cannot slip the
    // outcome past the subscription.
    let mut outcome = None;
    let wid = waiter_id();
    if request.wait {
        let hex_id = tx.hex_id();
        let (tx_sender, rx) = mpsc::unbounded_channel();
        st.hubs.by_id.subscribe(Some(wid), Some(hex_id.as_str()), move |info: &TransactionInfo| {
            let _ = tx_sender.send(info.clone());
        });
        outcome = Some(rx);
    }
    let hubs = st.hubs.clone();
    scopeguard::defer! {
        hubs.by_id.remove_connection(wid);
    }

    let create_ts = request.create_ts.unwrap_or_else(util::now_millis);
    let client = st.db.client().await?;
    match queries::insert_transaction(&**client, &tx, create_ts).await {
        Ok(()) => {}
        Err(queries::InsertTxError::Duplicate) => {
            return Err(RequestError::client("Transaction with id already exists."));
        }
        Err(queries::InsertTxError::Db(e)) => return Err(e.into()),
    }
    drop(client);

    let Some(mut rx) = outcome else {
        ctx.set_status(202);
        return Ok(Value::Null);
    };

    // Long poll: latency accounting would only measure the block interval.
    ctx.clear_latency();
    let info = rx.recv().await.ok_or_else(|| {
        RequestError::server(anyhow::anyhow!("transaction subscription ended unexpectedly"))
    })?;
    match info.status {
        TxStatus::Accepted => Ok(Value::Null),
        _ => Err(RequestError::client_with_status(
            422,
            info.message
                .unwrap_or_else(|| "Transaction was rejected.".to_owned()),
        )),
    }
}

/// Parsed `txStatus`/`transaction` request.
#[derive(Debug)]
struct TxQuery {
    ids: Vec<String>,
    /// A bare string request gets a bare response.
    single: bool,
    push: bool,
    wait: bool,
}

fn parse_tx_query(data: Value) -> Result<TxQuery, RequestError> {
    let invalid = || RequestError::client("Invalid format for txId.");
    let (raw_ids, single, push, wait) = match data {
        Value::String(id) => (vec![id], true, false, false),
        Value::Object(map) => {
            let push = map.get("push").and_then(Value::as_bool).unwrap_or(false);
            let wait = map.get("wait").and_then(Value::as_bool).unwrap_or(false);
            match map.get("txId") {
                Some(Value::String(id)) => (vec![id.clone()], true, push, wait),
                Some(Value::Array(list)) => {
                    let ids = list
                        .iter()
                        .map(|v| v.as_str().map(str::to_owned).ok_or_else(invalid))
                        .collect::<Result<Vec<_>, _>>()?;
                    (ids, false, push, wait)
                }
                _ => return Err(invalid()),
            }
        }
        _ => return Err(invalid()),
    };

    let mut ids = Vec::with_capacity(raw_ids.len());
    for id in raw_ids {
        let id = id.to_lowercase();
        match hex::decode(&id) {
            Ok(bytes) if bytes.len() == validana_core::transaction::ID_LEN => ids.push(id),
            _ => return Err(invalid()),
        }
    }
    if ids.is_empty() {
        return Err(invalid());
    }
    Ok(TxQuery { ids, single, push, wait })
}

fn tx_result(info: Option<&TransactionInfo>, full: bool) -> Value {
    match info {
        None => Value::Null,
        Some(info) if full => serde_json::to_value(info).unwrap_or(Value::Null),
        Some(info) => json!({
            "id": info.id,
            "status": info.status,
            "message": info.message,
        }),
    }
}

fn tx_results(query: &TxQuery, found: &HashMap<String, TransactionInfo>, full: bool) -> Value {
    let mut results: Vec<Value> = query
        .ids
        .iter()
        .map(|id| tx_result(found.get(id), full))
        .collect();
    if query.single {
        results.pop().unwrap_or(Value::Null)
    } else {
        Value::Array(results)
    }
}

/// Shared implementation of `txStatus` (status triples) and `transaction`
/// (full rows). `wait` blocks until every id has processed; `push` returns
/// what is available and pushes the rest as `pushType = "transaction"`.
async fn tx_lookup(st: Arc<Basics>, ctx: Arc<RequestContext>, data: Value, full: bool) -> HandlerResult {
    let query = parse_tx_query(data)?;

    if query.wait {
        return tx_wait(st, ctx, query, full).await;
    }
    if query.push {
        return tx_push(st, ctx, query, full).await;
    }

    let found = lookup(&st, &query.ids).await?;
    Ok(tx_results(&query, &found, full))
}

async fn lookup(st: &Basics, ids: &[String]) -> Result<HashMap<String, TransactionInfo>, RequestError> {
    let id_bytes: Vec<Vec<u8>> = ids.iter().filter_map(|id| hex::decode(id).ok()).collect();
    let client = st.db.client().await?;
    let rows = queries::transactions_by_ids(&**client, &id_bytes).await?;
    Ok(rows.into_iter().map(|row| (row.id.clone(), row)).collect())
}

async fn tx_wait(st: Arc<Basics>, ctx: Arc<RequestContext>, query: TxQuery, full: bool) -> HandlerResult {
    let wid = waiter_id();
    let (tx_sender, mut rx) = mpsc::unbounded_channel();
    for id in &query.ids {
        let tx_sender = tx_sender.clone();
        st.hubs.by_id.subscribe(Some(wid), Some(id.as_str()), move |info: &TransactionInfo| {
            let _ = tx_sender.send(info.clone());
        });
    }
    let hubs = st.hubs.clone();
    scopeguard::defer! {
        hubs.by_id.remove_connection(wid);
    }

    // The subscriptions exist before the snapshot, so nothing can process
    // in between unseen.
    let mut found = lookup(&st, &query.ids).await?;
    found.retain(|_, info| info.is_processed());

    ctx.clear_latency();
    let distinct: std::collections::HashSet<&String> = query.ids.iter().collect();
    while found.len() < distinct.len() {
        let info = rx.recv().await.ok_or_else(|| {
            RequestError::server(anyhow::anyhow!("transaction subscription ended unexpectedly"))
        })?;
        if info.is_processed() {
            found.insert(info.id.clone(), info);
        }
    }
    Ok(tx_results(&query, &found, full))
}

async fn tx_push(st: Arc<Basics>, ctx: Arc<RequestContext>, query: TxQuery, full: bool) -> HandlerResult {
    let Some(pusher) = ctx.pusher().cloned() else {
        return Err(RequestError::client("Cannot push on this connection."));
    };
    let conn_id = pusher.conn_id();

    // Snapshot first; anything not yet processed gets a subscription bound
    // to the connection, removed again when the socket closes.
    let mut found = lookup(&st, &query.ids).await?;
    found.retain(|_, info| info.is_processed());

    for id in &query.ids {
        if found.contains_key(id) {
            continue;
        }
        let pusher = pusher.clone();
        let hubs = st.hubs.clone();
        let subtype = id.clone();
        st.hubs.by_id.subscribe(Some(conn_id), Some(id.as_str()), move |info: &TransactionInfo| {
            if !info.is_processed() {
                return;
            }
            pusher.push("transaction", tx_result(Some(info), full), 200);
            // One outcome per id; drop the subscription afterwards.
            hubs.by_id.unsubscribe(Some(conn_id), Some(subtype.as_str()));
        });
    }
    let hubs = st.hubs.clone();
    pusher.on_close(Box::new(move || hubs.remove_connection(conn_id)));

    ctx.clear_latency();
    Ok(tx_results(&query, &found, full))
}

#[derive(Deserialize)]
struct MetricsRequest {
    format: String,
    token: String,
}

/// Token comparison through fixed-size hashes: equality on `blake3::Hash`
/// is constant-time, so the comparison leaks nothing about the token.
fn token_matches(provided: &str, configured: &str) -> bool {
    blake3::hash(provided.as_bytes()) == blake3::hash(configured.as_bytes())
}

async fn metrics(st: Arc<Basics>, ctx: Arc<RequestContext>, data: Value) -> HandlerResult {
    let request: MetricsRequest = serde_json::from_value(data)
        .map_err(|_| RequestError::client("Invalid format for metrics request."))?;

    let authorized = st
        .config
        .metrics_token
        .as_deref()
        .is_some_and(|configured| token_matches(&request.token, configured));
    if !authorized {
        return Err(RequestError::client_with_status(401, "Invalid token."));
    }

    ctx.clear_latency();
    let formatted = st
        .exporter
        .export(&request.format, true)
        .await
        .map_err(|e| match e {
            ExportError::Disabled | ExportError::UnknownFormat(_) => {
                RequestError::client(e.to_string())
            }
            ExportError::Gather(cause) => RequestError::Server(cause),
        })?;
    ctx.set_header("Content-Type", formatted.content_type);
    Ok(Value::String(formatted.body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tx_query_accepts_string_array_and_options() {
        let q = parse_tx_query(json!("AB".repeat(16))).unwrap();
        assert_eq!(q.ids, vec!["ab".repeat(16)]);
        assert!(q.single && !q.push && !q.wait);

        let q = parse_tx_query(json!({
            "txId": ["00".repeat(16), "ff".repeat(16)],
            "push": true,
        }))
        .unwrap();
        assert_eq!(q.ids.len(), 2);
        assert!(!q.single && q.push && !q.wait);

        let q = parse_tx_query(json!({ "txId": "11".repeat(16), "wait": true })).unwrap();
        assert!(q.single && q.wait);
    }

    #[test]
    fn tx_query_rejects_malformed_ids() {
        for bad in [
            json!(42),
            json!({ "txId": 42 }),
            json!({}),
            json!("zz".repeat(16)),
            json!("ab"), // wrong length
            json!({ "txId": ["ab".repeat(16), 7] }),
            json!({ "txId": [] }),
        ] {
            let err = parse_tx_query(bad).unwrap_err();
            assert_eq!(err.client_message(), "Invalid format for txId.");
        }
    }

    #[test]
    fn contract_filter_accepts_string_object_or_nothing() {
        assert_eq!(parse_contract_filter(Value::Null).unwrap(), None);
        assert_eq!(
            parse_contract_filter(json!("coin")).unwrap(),
            Some("coin".to_owned())
        );
        assert_eq!(
            parse_contract_filter(json!({ "type": "coin" })).unwrap(),
            Some("coin".to_owned())
        );
        assert_eq!(parse_contract_filter(json!({})).unwrap(), None);
        assert!(parse_contract_filter(json!({ "type": 5 })).is_err());
    }

    #[test]
    fn token_comparison_matches_exactly() {
        assert!(token_matches("right", "right"));
        assert!(!token_matches("wrong", "right"));
        assert!(!token_matches("", "right"));
        assert!(!token_matches("righ", "right"));
    }

    #[test]
    fn tx_results_preserve_request_order_and_shape() {
        let id_a = "aa".repeat(16);
        let id_b = "bb".repeat(16);
        let info = TransactionInfo {
            id: id_a.clone(),
            version: 1,
            contract_hash: "00".repeat(32),
            valid_till: 0,
            payload: String::new(),
            signature: String::new(),
            public_key: String::new(),
            create_ts: 1,
            block_id: Some(4),
            position_in_block: Some(0),
            processed_ts: Some(2),
            status: TxStatus::Accepted,
            sender: None,
            receiver: None,
            contract_type: None,
            message: None,
        };
        let mut found = HashMap::new();
        found.insert(id_a.clone(), info);

        let query = TxQuery {
            ids: vec![id_b.clone(), id_a.clone()],
            single: false,
            push: false,
            wait: false,
        };
        let results = tx_results(&query, &found, false);
        assert_eq!(results[0], Value::Null);
        assert_eq!(results[1]["id"], id_a);
        assert_eq!(results[1]["status"], "accepted");

        let query = TxQuery {
            ids: vec![id_a.clone()],
            single: true,
            push: false,
            wait: false,
        };
        let result = tx_results(&query, &found, true);
        assert_eq!(result["blockId"], 4);
    }
}
