//! The verb registry shared by both protocols.
//!
//! Each API version maps lower-cased verbs to handlers. Modules register
//! their verbs by taking a `&mut Dispatcher`; once serving starts the
//! dispatcher is frozen behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use validana_core::hub::EventHub;

use crate::errors::RequestError;
use crate::message::RequestContext;

pub type HandlerResult = Result<Value, RequestError>;

type BoxHandler =
    Box<dyn Fn(Arc<RequestContext>, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct VerbEntry {
    handler: BoxHandler,
    log: bool,
}

/// Emitted on the introspection hub before every dispatch.
#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub version: String,
    pub verb: String,
}

#[derive(Default)]
pub struct Dispatcher {
    versions: HashMap<String, HashMap<String, VerbEntry>>,
    message_hub: EventHub<MessageEvent>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Register `verb` under `version`. Both are matched case-insensitively.
    /// `log` controls the per-dispatch debug line (metrics polling would
    /// otherwise drown the log).
    pub fn register(
        &mut self,
        version: &str,
        verb: &str,
        log: bool,
        handler: impl Fn(Arc<RequestContext>, Value) -> BoxFuture<'static, HandlerResult>
            + Send
            + Sync
            + 'static,
    ) {
        self.versions
            .entry(version.to_lowercase())
            .or_default()
            .insert(
                verb.to_lowercase(),
                VerbEntry {
                    handler: Box::new(handler),
                    log,
                },
            );
    }

    pub fn has_version(&self, version: &str) -> bool {
        self.versions.contains_key(&version.to_lowercase())
    }

    /// Known verbs of a version, sorted for stable error messages.
    pub fn verbs(&self, version: &str) -> Vec<String> {
        let mut verbs: Vec<String> = self
            .versions
            .get(&version.to_lowercase())
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        verbs.sort();
        verbs
    }

    /// Observe every dispatch, before the handler runs.
    pub fn message_hub(&self) -> &EventHub<MessageEvent> {
        &self.message_hub
    }

    /// Dispatch one request. `ctx.verb` must already be lower-cased by the
    /// protocol. Unknown verbs are client errors naming the alternatives.
    pub async fn receive(&self, ctx: &Arc<RequestContext>, data: Value) -> HandlerResult {
        self.message_hub.emit(
            &MessageEvent {
                version: ctx.version.clone(),
                verb: ctx.verb.clone(),
            },
            None,
        );

        let entry = self
            .versions
            .get(&ctx.version)
            .and_then(|verbs| verbs.get(&ctx.verb))
            .ok_or_else(|| {
                RequestError::client(format!(
                    "Invalid type: {}, supported types: {}",
                    ctx.verb,
                    self.verbs(&ctx.version).join(", ")
                ))
            })?;

        if entry.log {
            tracing::debug!(version = %ctx.version, verb = %ctx.verb, "dispatching request");
        }
        (entry.handler)(ctx.clone(), data).await
    }
}
