//! The in-flight request unit handed to verb handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use validana_core::hub::ConnId;

/// Per-connection key/value mapping. HTTP requests get a fresh one; a
/// WebSocket session shares one across all of its messages.
#[derive(Clone, Default)]
pub struct Session {
    inner: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl Session {
    pub fn new() -> Session {
        Session::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().remove(key)
    }
}

/// Server-push access for session-scoped transports. Implemented by the
/// WebSocket connection; HTTP requests have none.
pub trait Pusher: Send + Sync {
    fn conn_id(&self) -> ConnId;
    /// Send `{ pushType, data, status }`. Returns false if the socket is gone.
    fn push(&self, push_type: &str, data: serde_json::Value, status: u16) -> bool;
    /// Register a hook run when the connection closes. Runs immediately if
    /// it already has.
    fn on_close(&self, hook: Box<dyn FnOnce() + Send>);
}

/// Everything a verb handler may read or override about the request it is
/// serving. Shared between the protocol and the handler's future, so the
/// overridable pieces are interior-mutable.
pub struct RequestContext {
    pub version: String,
    pub verb: String,
    pub received_at: Instant,
    /// Response status override; 0 means "unset, protocol default applies".
    status: AtomicU16,
    /// Response header overrides. A handler-set `Content-Type` means the
    /// returned value is already a serialised string.
    response_headers: Mutex<Vec<(String, String)>>,
    /// WebSocket request correlation id.
    pub message_id: Option<String>,
    pub session: Session,
    latency_tracked: AtomicBool,
    pusher: Option<Arc<dyn Pusher>>,
}

impl RequestContext {
    /// `received_at` is the transport-level arrival time, so latency covers
    /// body accumulation too.
    pub fn new_http(version: String, verb: String, received_at: Instant) -> Arc<RequestContext> {
        Arc::new(RequestContext {
            version,
            verb,
            received_at,
            status: AtomicU16::new(0),
            response_headers: Mutex::new(Vec::new()),
            message_id: None,
            session: Session::new(),
            latency_tracked: AtomicBool::new(true),
            pusher: None,
        })
    }

    pub fn new_ws(
        version: String,
        verb: String,
        message_id: String,
        session: Session,
        pusher: Arc<dyn Pusher>,
    ) -> Arc<RequestContext> {
        Arc::new(RequestContext {
            version,
            verb,
            received_at: Instant::now(),
            status: AtomicU16::new(0),
            response_headers: Mutex::new(Vec::new()),
            message_id: Some(message_id),
            session,
            latency_tracked: AtomicBool::new(true),
            pusher: Some(pusher),
        })
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Relaxed);
    }

    /// The handler's status override, if any.
    pub fn status(&self) -> Option<u16> {
        match self.status.load(Relaxed) {
            0 => None,
            status => Some(status),
        }
    }

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers.lock().push((name.into(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.response_headers
            .lock()
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        self.response_headers.lock().clone()
    }

    /// Opt this request out of latency accounting. Long-polling `wait`
    /// semantics, pushes and metrics export would only skew the histogram.
    pub fn clear_latency(&self) {
        self.latency_tracked.store(false, Relaxed);
    }

    pub fn latency_tracked(&self) -> bool {
        self.latency_tracked.load(Relaxed)
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.received_at.elapsed().as_millis() as i64
    }

    pub fn can_push(&self) -> bool {
        self.pusher.is_some()
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        self.pusher.as_ref().map(|p| p.conn_id())
    }

    pub fn pusher(&self) -> Option<&Arc<dyn Pusher>> {
        self.pusher.as_ref()
    }

    /// Push to the underlying connection. On a request-scoped transport this
    /// is a logged no-op: HTTP cannot push.
    pub fn push(&self, push_type: &str, data: serde_json::Value, status: u16) -> bool {
        match &self.pusher {
            Some(pusher) => pusher.push(push_type, data, status),
            None => {
                tracing::error!(verb = %self.verb, "attempted to push on a connection that cannot push");
                false
            }
        }
    }
}
