//! Per-worker metrics.
//!
//! Two groups with different lifecycles: "total" counters accumulate and are
//! reset once their delta lands in the shared store (one `worker = -1` row
//! per metric, summed across workers), while "current" gauges are snapshots
//! overwritten under the worker's own id. Histograms keep non-cumulative
//! buckets locally; the prometheus exporter makes them cumulative.

pub mod export;
pub mod sync;

use std::sync::atomic::{AtomicI64, Ordering::Relaxed};
use std::sync::Arc;

/// Upper bounds (ms) of the request latency histogram; overflow lands in Inf.
pub const LATENCY_BOUNDS_MS: &[i64] = &[8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];
/// Upper bounds (s) of the WebSocket connection lifetime histogram.
pub const WEBSOCKET_BOUNDS_S: &[i64] = &[10, 30, 60, 120, 300, 900];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Rest,
    Ws,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    ClientError,
    ServerError,
}

impl ResponseClass {
    pub fn from_status(status: u16) -> ResponseClass {
        match status {
            0..=399 => ResponseClass::Success,
            400..=499 => ResponseClass::ClientError,
            _ => ResponseClass::ServerError,
        }
    }
}

/// Linear-bucket histogram with a carried sum.
pub struct Histogram {
    prefix: &'static str,
    bounds: &'static [i64],
    /// One bucket per bound plus the overflow ("Inf") bucket.
    buckets: Vec<AtomicI64>,
    sum: AtomicI64,
}

impl Histogram {
    fn new(prefix: &'static str, bounds: &'static [i64]) -> Histogram {
        Histogram {
            prefix,
            bounds,
            buckets: (0..=bounds.len()).map(|_| AtomicI64::new(0)).collect(),
            sum: AtomicI64::new(0),
        }
    }

    pub fn observe(&self, value: i64) {
        let index = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.buckets[index].fetch_add(1, Relaxed);
        self.sum.fetch_add(value, Relaxed);
    }

    fn for_each(&self, mut f: impl FnMut(String, &AtomicI64)) {
        for (index, bucket) in self.buckets.iter().enumerate() {
            let name = match self.bounds.get(index) {
                Some(bound) => format!("{}{}", self.prefix, bound),
                None => format!("{}Inf", self.prefix),
            };
            f(name, bucket);
        }
        f(format!("{}Total", self.prefix), &self.sum);
    }
}

/// The worker's metric registry. One instance per worker process.
pub struct Metrics {
    // Totals.
    requests: [[AtomicI64; 2]; 3],
    latency: Histogram,
    websocket_duration: Histogram,
    // Currents.
    memory_mb: AtomicI64,
    ws_connections: AtomicI64,
    last_sync_ms: AtomicI64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics {
            requests: Default::default(),
            latency: Histogram::new("latency", LATENCY_BOUNDS_MS),
            websocket_duration: Histogram::new("websocket", WEBSOCKET_BOUNDS_S),
            memory_mb: AtomicI64::new(0),
            ws_connections: AtomicI64::new(0),
            last_sync_ms: AtomicI64::new(0),
        }
    }

    pub fn shared() -> Arc<Metrics> {
        Arc::new(Metrics::new())
    }

    pub fn record_request(&self, transport: Transport, class: ResponseClass) {
        self.requests[class as usize][transport as usize].fetch_add(1, Relaxed);
    }

    pub fn observe_latency_ms(&self, ms: i64) {
        self.latency.observe(ms);
    }

    pub fn observe_ws_duration_secs(&self, secs: i64) {
        self.websocket_duration.observe(secs);
    }

    pub fn ws_connected(&self) {
        self.ws_connections.fetch_add(1, Relaxed);
    }

    pub fn ws_disconnected(&self) {
        self.ws_connections.fetch_sub(1, Relaxed);
    }

    pub fn ws_connections(&self) -> i64 {
        self.ws_connections.load(Relaxed)
    }

    pub fn set_memory_mb(&self, mb: i64) {
        self.memory_mb.store(mb, Relaxed);
    }

    pub fn mark_synced(&self, now_ms: i64) {
        self.last_sync_ms.store(now_ms, Relaxed);
    }

    fn request_counter_name(class: usize, transport: usize) -> String {
        let class = ["Success", "ClientError", "ServerError"][class];
        let transport = ["Rest", "Ws"][transport];
        format!("requests{class}{transport}")
    }

    fn for_each_total(&self, mut f: impl FnMut(String, &AtomicI64)) {
        for (class, per_transport) in self.requests.iter().enumerate() {
            for (transport, counter) in per_transport.iter().enumerate() {
                f(Self::request_counter_name(class, transport), counter);
            }
        }
        self.latency.for_each(&mut f);
        self.websocket_duration.for_each(&mut f);
    }

    /// Snapshot every total counter. After a successful sync the snapshot is
    /// subtracted rather than the live value zeroed, so increments that land
    /// during persistence are never lost.
    pub fn totals_snapshot(&self) -> Vec<(String, i64)> {
        let mut out = Vec::new();
        self.for_each_total(|name, counter| out.push((name, counter.load(Relaxed))));
        out
    }

    pub fn subtract_totals(&self, snapshot: &[(String, i64)]) {
        let mut index = 0;
        self.for_each_total(|name, counter| {
            debug_assert_eq!(name, snapshot[index].0);
            counter.fetch_sub(snapshot[index].1, Relaxed);
            index += 1;
        });
    }

    /// The current gauges, refreshed at call time.
    pub fn currents(&self) -> Vec<(String, i64)> {
        vec![
            ("memory".to_owned(), self.memory_mb.load(Relaxed)),
            ("wsConnections".to_owned(), self.ws_connections.load(Relaxed)),
            ("lastSync".to_owned(), self.last_sync_ms.load(Relaxed)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn total(metrics: &Metrics, name: &str) -> i64 {
        metrics
            .totals_snapshot()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .unwrap_or_else(|| panic!("no total named {name}"))
    }

    #[test]
    fn request_counters_use_corrected_names() {
        let metrics = Metrics::new();
        metrics.record_request(Transport::Rest, ResponseClass::Success);
        metrics.record_request(Transport::Ws, ResponseClass::ClientError);
        metrics.record_request(Transport::Ws, ResponseClass::ClientError);
        metrics.record_request(Transport::Rest, ResponseClass::ServerError);

        assert_eq!(total(&metrics, "requestsSuccessRest"), 1);
        assert_eq!(total(&metrics, "requestsClientErrorWs"), 2);
        assert_eq!(total(&metrics, "requestsServerErrorRest"), 1);
        assert_eq!(total(&metrics, "requestsSuccessWs"), 0);
    }

    #[test]
    fn latency_lands_in_the_right_bucket() {
        let metrics = Metrics::new();
        metrics.observe_latency_ms(8); // on the bound: inclusive
        metrics.observe_latency_ms(9);
        metrics.observe_latency_ms(5000);

        assert_eq!(total(&metrics, "latency8"), 1);
        assert_eq!(total(&metrics, "latency16"), 1);
        assert_eq!(total(&metrics, "latencyInf"), 1);
        assert_eq!(total(&metrics, "latencyTotal"), 8 + 9 + 5000);
    }

    #[test]
    fn response_class_from_status() {
        assert_eq!(ResponseClass::from_status(200), ResponseClass::Success);
        assert_eq!(ResponseClass::from_status(202), ResponseClass::Success);
        assert_eq!(ResponseClass::from_status(400), ResponseClass::ClientError);
        assert_eq!(ResponseClass::from_status(422), ResponseClass::ClientError);
        assert_eq!(ResponseClass::from_status(500), ResponseClass::ServerError);
    }

    #[test]
    fn subtract_keeps_increments_made_after_the_snapshot() {
        let metrics = Metrics::new();
        metrics.record_request(Transport::Rest, ResponseClass::Success);
        metrics.record_request(Transport::Rest, ResponseClass::Success);
        let snapshot = metrics.totals_snapshot();

        // Lands between snapshot and subtraction; must survive the reset.
        metrics.record_request(Transport::Rest, ResponseClass::Success);
        metrics.subtract_totals(&snapshot);

        assert_eq!(total(&metrics, "requestsSuccessRest"), 1);
    }

    #[test]
    fn currents_track_gauges() {
        let metrics = Metrics::new();
        metrics.ws_connected();
        metrics.ws_connected();
        metrics.ws_disconnected();
        metrics.set_memory_mb(120);
        metrics.mark_synced(42);

        let currents: std::collections::HashMap<_, _> = metrics.currents().into_iter().collect();
        assert_eq!(currents["wsConnections"], 1);
        assert_eq!(currents["memory"], 120);
        assert_eq!(currents["lastSync"], 42);
    }
}
