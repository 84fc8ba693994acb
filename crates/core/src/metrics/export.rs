//! Export of the cross-worker metrics landed in `basics.metrics`.
//!
//! The store is the source of truth here, not the local registry: totals are
//! read from the shared `worker = -1` rows and currents aggregated per
//! metric into a per-worker array. Formatters turn that into a response
//! body; `json` and `prometheus` are built in, and callers can register
//! their own.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use super::{LATENCY_BOUNDS_MS, WEBSOCKET_BOUNDS_S};
use crate::db::{queries, Database};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Gathering metrics is disabled.")]
    Disabled,
    #[error("Unknown metrics format: {0}.")]
    UnknownFormat(String),
    #[error(transparent)]
    Gather(#[from] anyhow::Error),
}

/// Aggregated metric rows, as handed to formatters.
#[derive(Debug, Default, Clone)]
pub struct ExportData {
    /// Cross-worker counters, one value per metric.
    pub totals: BTreeMap<String, i64>,
    /// Gauges, one value per live worker per metric.
    pub currents: BTreeMap<String, Vec<i64>>,
}

pub struct FormattedMetrics {
    pub content_type: String,
    pub body: String,
}

pub type FormatterFn =
    Arc<dyn Fn(&ExportData, bool) -> anyhow::Result<FormattedMetrics> + Send + Sync>;

pub struct MetricsExporter {
    db: Database,
    enabled: bool,
    formatters: RwLock<HashMap<String, FormatterFn>>,
}

impl MetricsExporter {
    pub fn new(db: Database, enabled: bool) -> Arc<MetricsExporter> {
        let exporter = MetricsExporter {
            db,
            enabled,
            formatters: RwLock::new(HashMap::new()),
        };
        exporter.register_format("json", |data, include_defaults| {
            Ok(FormattedMetrics {
                content_type: "application/json".to_owned(),
                body: format_json(data, include_defaults).to_string(),
            })
        });
        exporter.register_format("prometheus", |data, include_defaults| {
            Ok(FormattedMetrics {
                content_type: "text/plain; charset=UTF-8".to_owned(),
                body: format_prometheus(data, include_defaults),
            })
        });
        Arc::new(exporter)
    }

    pub fn register_format(
        &self,
        name: impl Into<String>,
        formatter: impl Fn(&ExportData, bool) -> anyhow::Result<FormattedMetrics> + Send + Sync + 'static,
    ) {
        self.formatters.write().insert(name.into(), Arc::new(formatter));
    }

    pub async fn export(
        &self,
        format: &str,
        include_defaults: bool,
    ) -> Result<FormattedMetrics, ExportError> {
        if !self.enabled {
            return Err(ExportError::Disabled);
        }
        let formatter = self
            .formatters
            .read()
            .get(format)
            .cloned()
            .ok_or_else(|| ExportError::UnknownFormat(format.to_owned()))?;

        let data = self.gather().await?;
        Ok(formatter(&data, include_defaults)?)
    }

    async fn gather(&self) -> anyhow::Result<ExportData> {
        let client = self.db.client().await?;
        let totals = queries::export_total_metrics(&**client).await?;
        let currents = queries::export_current_metrics(&**client).await?;

        let mut data = ExportData::default();
        data.totals.extend(totals);
        for (metric, values) in currents {
            let values = values
                .as_array()
                .map(|list| list.iter().filter_map(|v| v.as_i64()).collect())
                .unwrap_or_default();
            data.currents.insert(metric, values);
        }
        Ok(data)
    }
}

fn histogram_values(
    totals: &BTreeMap<String, i64>,
    prefix: &str,
    bounds: &[i64],
) -> (Vec<(String, i64)>, i64) {
    let mut buckets = Vec::with_capacity(bounds.len() + 1);
    for bound in bounds {
        let name = format!("{prefix}{bound}");
        buckets.push((bound.to_string(), totals.get(&name).copied().unwrap_or(0)));
    }
    buckets.push((
        "Inf".to_owned(),
        totals.get(&format!("{prefix}Inf")).copied().unwrap_or(0),
    ));
    let sum = totals.get(&format!("{prefix}Total")).copied().unwrap_or(0);
    (buckets, sum)
}

/// The `json` format: request counters and histograms grouped into nested
/// objects, currents as per-worker arrays.
pub(crate) fn format_json(data: &ExportData, include_defaults: bool) -> serde_json::Value {
    use serde_json::{json, Map, Value};

    let mut root = Map::new();
    if include_defaults {
        let mut requests = Map::new();
        for (class, key) in [("Success", "success"), ("ClientError", "clientError"), ("ServerError", "serverError")] {
            requests.insert(
                key.to_owned(),
                json!({
                    "rest": data.totals.get(&format!("requests{class}Rest")).copied().unwrap_or(0),
                    "ws": data.totals.get(&format!("requests{class}Ws")).copied().unwrap_or(0),
                }),
            );
        }
        root.insert("requests".to_owned(), Value::Object(requests));

        for (key, prefix, bounds) in [
            ("latency", "latency", LATENCY_BOUNDS_MS),
            ("websocket", "websocket", WEBSOCKET_BOUNDS_S),
        ] {
            let (buckets, sum) = histogram_values(&data.totals, prefix, bounds);
            let mut histogram = Map::new();
            for (bound, count) in buckets {
                histogram.insert(bound, json!(count));
            }
            histogram.insert("total".to_owned(), json!(sum));
            root.insert(key.to_owned(), Value::Object(histogram));
        }

        for (metric, values) in &data.currents {
            root.insert(metric.clone(), json!(values));
        }
    }
    Value::Object(root)
}

/// The `prometheus` text exposition: cumulative histogram buckets with an
/// explicit `+Inf` tail, `_sum` and `_count`, gauges labelled by worker.
pub(crate) fn format_prometheus(data: &ExportData, include_defaults: bool) -> String {
    let mut out = String::new();
    if !include_defaults {
        return out;
    }

    out.push_str("# TYPE validana_requests counter\n");
    for (class, label) in [("Success", "success"), ("ClientError", "client_error"), ("ServerError", "server_error")] {
        for (transport, tlabel) in [("Rest", "rest"), ("Ws", "ws")] {
            let value = data
                .totals
                .get(&format!("requests{class}{transport}"))
                .copied()
                .unwrap_or(0);
            let _ = writeln!(
                out,
                "validana_requests{{transport=\"{tlabel}\",result=\"{label}\"}} {value}"
            );
        }
    }

    for (name, prefix, bounds) in [
        ("validana_latency", "latency", LATENCY_BOUNDS_MS),
        ("validana_websocket_duration", "websocket", WEBSOCKET_BOUNDS_S),
    ] {
        let (buckets, sum) = histogram_values(&data.totals, prefix, bounds);
        let _ = writeln!(out, "# TYPE {name} histogram");
        let mut cumulative = 0;
        for (bound, count) in &buckets {
            cumulative += count;
            let le = if bound == "Inf" { "+Inf" } else { bound };
            let _ = writeln!(out, "{name}_bucket{{le=\"{le}\"}} {cumulative}");
        }
        let _ = writeln!(out, "{name}_sum {sum}");
        let _ = writeln!(out, "{name}_count {cumulative}");
    }

    for (metric, prom_name) in [
        ("memory", "validana_memory_mb"),
        ("wsConnections", "validana_ws_connections"),
        ("lastSync", "validana_last_sync_ms"),
    ] {
        let _ = writeln!(out, "# TYPE {prom_name} gauge");
        if let Some(values) = data.currents.get(metric) {
            for (worker, value) in values.iter().enumerate() {
                let _ = writeln!(out, "{prom_name}{{worker=\"{worker}\"}} {value}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_data() -> ExportData {
        let mut data = ExportData::default();
        data.totals.insert("requestsSuccessRest".into(), 5);
        data.totals.insert("requestsClientErrorWs".into(), 2);
        data.totals.insert("latency8".into(), 3);
        data.totals.insert("latency16".into(), 1);
        data.totals.insert("latencyInf".into(), 2);
        data.totals.insert("latencyTotal".into(), 9000);
        data.currents.insert("memory".into(), vec![100, 110]);
        data.currents.insert("wsConnections".into(), vec![7, 3]);
        data
    }

    #[test]
    fn prometheus_buckets_are_cumulative_and_end_in_inf() {
        let body = format_prometheus(&sample_data(), true);
        assert!(body.contains("validana_latency_bucket{le=\"8\"} 3"), "{body}");
        assert!(body.contains("validana_latency_bucket{le=\"16\"} 4"), "{body}");
        // Empty intermediate buckets keep the running total.
        assert!(body.contains("validana_latency_bucket{le=\"4096\"} 4"), "{body}");
        assert!(body.contains("validana_latency_bucket{le=\"+Inf\"} 6"), "{body}");
        assert!(body.contains("validana_latency_sum 9000"), "{body}");
        assert!(body.contains("validana_latency_count 6"), "{body}");
    }

    #[test]
    fn prometheus_bucket_counts_are_monotonic() {
        let body = format_prometheus(&sample_data(), true);
        let counts: Vec<i64> = body
            .lines()
            .filter(|l| l.starts_with("validana_latency_bucket"))
            .map(|l| l.rsplit(' ').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(counts.len(), LATENCY_BOUNDS_MS.len() + 1);
        assert!(counts.windows(2).all(|w| w[0] <= w[1]), "{counts:?}");
    }

    #[test]
    fn prometheus_gauges_carry_worker_labels() {
        let body = format_prometheus(&sample_data(), true);
        assert!(body.contains("validana_memory_mb{worker=\"0\"} 100"), "{body}");
        assert!(body.contains("validana_memory_mb{worker=\"1\"} 110"), "{body}");
        assert!(body.contains("validana_ws_connections{worker=\"1\"} 3"), "{body}");
    }

    #[test]
    fn json_format_nests_counters_and_histograms() {
        let value = format_json(&sample_data(), true);
        assert_eq!(value["requests"]["success"]["rest"], 5);
        assert_eq!(value["requests"]["clientError"]["ws"], 2);
        assert_eq!(value["latency"]["8"], 3);
        assert_eq!(value["latency"]["Inf"], 2);
        assert_eq!(value["latency"]["total"], 9000);
        assert_eq!(value["memory"][1], 110);
    }

    #[test]
    fn excluding_defaults_yields_empty_output() {
        assert_eq!(format_prometheus(&sample_data(), false), "");
        assert_eq!(format_json(&sample_data(), false), serde_json::json!({}));
    }
}
