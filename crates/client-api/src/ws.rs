//! The WebSocket protocol.
//!
//! Connections are session-scoped: one session map, many request/response
//! pairs correlated by `id`, plus server pushes. Verb dispatch is pipelined;
//! responses go out in completion order. Liveness is enforced by an
//! amortised ping/pong check, and a permanent shutdown closes every socket
//! with code 1001.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use validana_core::hub::ConnId;
use validana_core::metrics::{Metrics, ResponseClass, Transport};

use crate::errors::RequestError;
use crate::message::{Pusher, RequestContext, Session};
use crate::ApiShared;

/// Close codes used by this protocol.
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INVALID_URL: u16 = 4100;

enum Outgoing {
    Text(String),
    Ping,
    Close(CloseFrame<'static>),
}

/// One live WebSocket client.
pub struct WsConnection {
    pub id: ConnId,
    out: mpsc::UnboundedSender<Outgoing>,
    /// Keep-alive flag: set by pongs, cleared by pings.
    alive: AtomicBool,
    connected_at: Instant,
    session: Session,
    /// `closed` transitions under this lock so a hook registered during
    /// close still runs exactly once.
    close_hooks: Mutex<CloseHooks>,
}

struct CloseHooks {
    closed: bool,
    hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl WsConnection {
    fn send_text(&self, text: String) -> bool {
        self.out.send(Outgoing::Text(text)).is_ok()
    }

    fn send_ping(&self) {
        let _ = self.out.send(Outgoing::Ping);
    }

    /// Ask the writer to send a close frame; the read loop tears the
    /// connection down when the transport drops.
    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.out.send(Outgoing::Close(CloseFrame {
            code,
            reason: reason.into(),
        }));
    }

    fn run_close_hooks(&self) {
        let hooks = {
            let mut guard = self.close_hooks.lock();
            guard.closed = true;
            std::mem::take(&mut guard.hooks)
        };
        for hook in hooks {
            hook();
        }
    }
}

impl Pusher for WsConnection {
    fn conn_id(&self) -> ConnId {
        self.id
    }

    fn push(&self, push_type: &str, data: Value, status: u16) -> bool {
        let frame = json!({ "pushType": push_type, "data": data, "status": status });
        self.send_text(frame.to_string())
    }

    fn on_close(&self, hook: Box<dyn FnOnce() + Send>) {
        let mut guard = self.close_hooks.lock();
        if guard.closed {
            drop(guard);
            hook();
        } else {
            guard.hooks.push(hook);
        }
    }
}

/// All live connections of one worker.
pub struct WsRegistry {
    connections: Mutex<HashMap<ConnId, Arc<WsConnection>>>,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl WsRegistry {
    pub fn new(metrics: Arc<Metrics>) -> Arc<WsRegistry> {
        Arc::new(WsRegistry {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
        })
    }

    fn insert(&self, out: mpsc::UnboundedSender<Outgoing>) -> Arc<WsConnection> {
        let conn = Arc::new(WsConnection {
            id: self.next_id.fetch_add(1, Relaxed),
            out,
            alive: AtomicBool::new(true),
            connected_at: Instant::now(),
            session: Session::new(),
            close_hooks: Mutex::new(CloseHooks {
                closed: false,
                hooks: Vec::new(),
            }),
        });
        self.connections.lock().insert(conn.id, conn.clone());
        self.metrics.ws_connected();
        conn
    }

    /// Unregister and clean up. Only the first caller for a given id does
    /// the bookkeeping, so the close path is safe to hit twice.
    fn remove(&self, id: ConnId) {
        let Some(conn) = self.connections.lock().remove(&id) else {
            return;
        };
        self.metrics.ws_disconnected();
        self.metrics
            .observe_ws_duration_secs(conn.connected_at.elapsed().as_secs() as i64);
        conn.run_close_hooks();
    }

    fn get(&self, id: ConnId) -> Option<Arc<WsConnection>> {
        self.connections.lock().get(&id).cloned()
    }

    fn ids(&self) -> Vec<ConnId> {
        self.connections.lock().keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Close every socket with 1001. Graceful shutdown waits for the peers
    /// to hang up; a non-graceful one forces the remainder after five
    /// seconds.
    pub async fn shutdown(&self, graceful: bool) {
        let conns: Vec<_> = self.connections.lock().values().cloned().collect();
        for conn in &conns {
            conn.close(CLOSE_GOING_AWAY, "Server is shutting down.");
        }
        if graceful {
            while self.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        } else {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.connection_count() > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            for id in self.ids() {
                self.remove(id);
            }
        }
    }

    /// The keep-alive loop. Every second it touches
    /// `ceil(|to_check| / remaining_seconds)` clients, so one full pass
    /// costs one keep-alive period regardless of connection count. A client
    /// that has not ponged since its last ping is closed with 1001.
    pub fn spawn_keepalive(
        self: &Arc<Self>,
        interval_secs: u64,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            let mut to_check: Vec<ConnId> = Vec::new();
            let mut remaining: u64 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if remaining == 0 {
                    to_check = registry.ids();
                    remaining = interval_secs.max(1);
                }
                let batch = to_check.len().div_ceil(remaining as usize);
                for id in to_check.drain(..batch.min(to_check.len())) {
                    let Some(conn) = registry.get(id) else { continue };
                    if conn.alive.swap(false, Relaxed) {
                        conn.send_ping();
                    } else {
                        tracing::debug!(conn = id, "closing unresponsive websocket client");
                        conn.close(CLOSE_GOING_AWAY, "Keep-alive timeout.");
                    }
                }
                remaining -= 1;
            }
        })
    }
}

/// Accept (or reject) an upgrade. The decoded, lower-cased path must
/// contain a registered API version; otherwise the socket is accepted and
/// immediately closed with 4100.
pub fn handle_upgrade(
    shared: Arc<ApiShared>,
    path: &str,
    upgrade: WebSocketUpgrade,
) -> Response {
    let version = percent_encoding::percent_decode_str(path)
        .decode_utf8()
        .ok()
        .and_then(|decoded| {
            decoded
                .split('/')
                .map(str::to_lowercase)
                .find(|segment| shared.dispatcher.has_version(segment))
        });

    match version {
        Some(version) => {
            upgrade.on_upgrade(move |socket| client_session(shared, version, socket))
        }
        None => upgrade.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_INVALID_URL,
                    reason: "Invalid api version.".into(),
                })))
                .await;
        }),
    }
}

async fn client_session(shared: Arc<ApiShared>, version: String, socket: WebSocket) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let conn = shared.ws.insert(out_tx);
    tracing::debug!(conn = conn.id, "websocket client connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(outgoing) = out_rx.recv().await {
            let result = match outgoing {
                Outgoing::Text(text) => sink.send(Message::Text(text)).await,
                Outgoing::Ping => sink.send(Message::Ping(Vec::new())).await,
                Outgoing::Close(frame) => {
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let shared = shared.clone();
                let conn = conn.clone();
                let version = version.clone();
                // Pipelined: slow verbs do not block the socket; responses
                // correlate by id in completion order.
                tokio::spawn(async move {
                    handle_frame(shared, conn, version, text).await;
                });
            }
            Ok(Message::Binary(_)) => {
                conn.send_text(
                    error_response(Value::Null, 400, "Only text frames are supported.").to_string(),
                );
            }
            Ok(Message::Pong(_)) => {
                conn.alive.store(true, Relaxed);
            }
            Ok(Message::Ping(_)) => {
                // The transport answers pings on its own.
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                // A peer vanishing mid-frame is routine; anything else is
                // worth a warning, and either way the socket is done.
                let text = e.to_string();
                if !text.contains("Connection reset") {
                    tracing::warn!(conn = conn.id, "websocket transport error: {text}");
                }
                break;
            }
        }
    }

    shared.ws.remove(conn.id);
    writer.abort();
    tracing::debug!(conn = conn.id, "websocket client disconnected");
}

/// Parsed inbound frame: `{ id, type, data? }`.
#[derive(Debug)]
struct Frame {
    id: String,
    verb: String,
    data: Value,
}

fn parse_frame(text: &str) -> Result<Frame, (Value, String)> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Err((Value::Null, "Invalid JSON message.".to_owned()));
    };
    let Some(object) = value.as_object() else {
        return Err((Value::Null, "Message must be a JSON object.".to_owned()));
    };
    let id = match object.get("id") {
        Some(Value::String(id)) => id.clone(),
        _ => return Err((Value::Null, "Invalid or missing message id.".to_owned())),
    };
    let verb = match object.get("type") {
        Some(Value::String(verb)) => verb.to_lowercase(),
        _ => {
            return Err((
                Value::String(id),
                "Invalid or missing message type.".to_owned(),
            ))
        }
    };
    let data = object.get("data").cloned().unwrap_or(Value::Null);
    Ok(Frame { id, verb, data })
}

fn error_response(id: Value, status: u16, error: &str) -> Value {
    json!({ "id": id, "status": status, "error": error })
}

async fn handle_frame(shared: Arc<ApiShared>, conn: Arc<WsConnection>, version: String, text: String) {
    let frame = match parse_frame(&text) {
        Ok(frame) => frame,
        Err((id, message)) => {
            shared
                .metrics
                .record_request(Transport::Ws, ResponseClass::ClientError);
            conn.send_text(error_response(id, 400, &message).to_string());
            return;
        }
    };

    let ctx = RequestContext::new_ws(
        version,
        frame.verb,
        frame.id.clone(),
        conn.session.clone(),
        conn.clone(),
    );
    let result = shared.dispatcher.receive(&ctx, frame.data).await;

    let response = match result {
        Ok(data) => {
            let status = ctx.status().unwrap_or(200);
            let mut response = json!({ "id": frame.id, "status": status });
            if !data.is_null() {
                response["data"] = data;
            }
            response
        }
        Err(RequestError::Client { status, message }) => {
            error_response(Value::String(frame.id), status, &message)
        }
        Err(RequestError::Server(error)) => {
            tracing::error!(verb = %ctx.verb, "error during websocket request: {error:#}");
            error_response(Value::String(frame.id), 500, crate::errors::GENERIC_ERROR_MESSAGE)
        }
    };

    let status = response["status"].as_u64().unwrap_or(500) as u16;
    shared
        .metrics
        .record_request(Transport::Ws, ResponseClass::from_status(status));
    if ctx.latency_tracked() {
        shared.metrics.observe_latency_ms(ctx.elapsed_ms());
    }
    conn.send_text(response.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_parsing_accepts_the_documented_shape() {
        let frame = parse_frame(r#"{"id":"a","type":"Time","data":{"x":1}}"#).unwrap();
        assert_eq!(frame.id, "a");
        assert_eq!(frame.verb, "time");
        assert_eq!(frame.data, json!({"x": 1}));

        let frame = parse_frame(r#"{"id":"b","type":"txstatus"}"#).unwrap();
        assert_eq!(frame.data, Value::Null);
    }

    #[test]
    fn frame_parsing_rejects_bad_input() {
        let (id, message) = parse_frame("not json").unwrap_err();
        assert_eq!(id, Value::Null);
        assert_eq!(message, "Invalid JSON message.");

        let (id, _) = parse_frame(r#"{"type":"time"}"#).unwrap_err();
        assert_eq!(id, Value::Null);

        let (id, _) = parse_frame(r#"{"id":7,"type":"time"}"#).unwrap_err();
        assert_eq!(id, Value::Null);

        let (id, message) = parse_frame(r#"{"id":"x","type":5}"#).unwrap_err();
        assert_eq!(id, Value::String("x".to_owned()));
        assert_eq!(message, "Invalid or missing message type.");
    }

    #[test]
    fn keepalive_batch_covers_all_clients_within_one_period() {
        // 10 clients over a 4 second period: 3+3+2+2.
        let mut to_check = 10usize;
        let mut touched = 0;
        for remaining in (1..=4u64).rev() {
            let batch = to_check.div_ceil(remaining as usize);
            touched += batch;
            to_check -= batch;
        }
        assert_eq!(touched, 10);
        assert_eq!(to_check, 0);
    }

    #[tokio::test]
    async fn both_protocols_reach_the_same_handler_with_the_same_data() {
        use crate::dispatcher::Dispatcher;
        use crate::message::RequestContext;
        use parking_lot::Mutex as PlMutex;

        let seen: Arc<PlMutex<Vec<Value>>> = Arc::new(PlMutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let recorder = seen.clone();
        dispatcher.register("v1", "txstatus", true, move |_ctx, data| {
            let recorder = recorder.clone();
            Box::pin(async move {
                recorder.lock().push(data);
                Ok(Value::Null)
            })
        });

        // HTTP: POST body through the parsing ladder.
        let http_data = crate::http::parse_body(r#"{"txId":"ff","push":false}"#);
        let http_ctx = RequestContext::new_http("v1".into(), "txstatus".into(), Instant::now());
        dispatcher.receive(&http_ctx, http_data).await.unwrap();

        // WebSocket: the same request as a frame.
        let frame = parse_frame(r#"{"id":"a","type":"txStatus","data":{"txId":"ff","push":false}}"#)
            .unwrap();
        let registry = WsRegistry::new(Metrics::shared());
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.insert(tx);
        let ws_ctx = RequestContext::new_ws(
            "v1".into(),
            frame.verb,
            frame.id,
            conn.session.clone(),
            conn.clone(),
        );
        dispatcher.receive(&ws_ctx, frame.data).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn registry_tracks_connections_and_close_hooks() {
        let metrics = Metrics::shared();
        let registry = WsRegistry::new(metrics.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.insert(tx);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(metrics.ws_connections(), 1);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        conn.on_close(Box::new(move || flag.store(true, Relaxed)));

        registry.remove(conn.id);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(metrics.ws_connections(), 0);
        assert!(ran.load(Relaxed));

        // Removing twice does not double-count.
        registry.remove(conn.id);
        assert_eq!(metrics.ws_connections(), 0);
    }
}
