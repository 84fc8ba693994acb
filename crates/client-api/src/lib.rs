//! HTTP and WebSocket protocol layer of the Validana gateway server.
//!
//! Both transports share one verb registry (the [`dispatcher::Dispatcher`])
//! and, when their configured ports match, one listening socket. The
//! protocols own their connections; handlers only see a
//! [`message::RequestContext`].

pub mod dispatcher;
pub mod errors;
pub mod handlers;
pub mod http;
pub mod message;
pub mod server;
pub mod ws;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use validana_core::config::Config;
use validana_core::metrics::Metrics;

use dispatcher::Dispatcher;
use server::{ServerOptions, TlsPaths};
use ws::WsRegistry;

/// State shared by every listener of one worker.
pub struct ApiShared {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
    pub ws: Arc<WsRegistry>,
}

/// Per-listener view: which protocols this socket serves.
pub struct ListenerState {
    pub shared: Arc<ApiShared>,
    pub http_enabled: bool,
    pub ws_enabled: bool,
}

/// The running protocol layer of one worker.
pub struct Protocols {
    shared: Arc<ApiShared>,
    stop: CancellationToken,
    /// Fired five seconds after a non-graceful shutdown request to destroy
    /// whatever sockets are still open.
    force: CancellationToken,
    servers: Vec<JoinHandle<()>>,
    keepalive: JoinHandle<()>,
}

impl Protocols {
    /// Start serving. HTTP and WebSocket share a listener iff their ports
    /// match; with TLS enabled both listeners use the configured key pair.
    pub fn start(shared: Arc<ApiShared>) -> anyhow::Result<Protocols> {
        let config = shared.config.clone();
        let stop = CancellationToken::new();
        let force = CancellationToken::new();

        let tls_paths = || -> anyhow::Result<Option<TlsPaths>> {
            if !config.tls {
                return Ok(None);
            }
            let key_path = config
                .key_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("TLS enabled without VSERVER_KEYPATH"))?;
            let cert_path = config
                .cert_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("TLS enabled without VSERVER_CERTPATH"))?;
            Ok(Some(TlsPaths { key_path, cert_path }))
        };

        let mut listeners = Vec::new();
        if config.shared_port() {
            listeners.push((config.http_port, true, true));
        } else {
            listeners.push((config.http_port, true, false));
            listeners.push((config.ws_port, false, true));
        }

        if let Some(paths) = tls_paths()? {
            server::validate_tls(&paths)?;
        }

        let mut servers = Vec::new();
        for (port, http_enabled, ws_enabled) in listeners {
            let state = Arc::new(ListenerState {
                shared: shared.clone(),
                http_enabled,
                ws_enabled,
            });
            let options = ServerOptions {
                port,
                tls: tls_paths()?,
            };
            let router = http::router(state);
            let stop = stop.clone();
            let force = force.clone();
            servers.push(tokio::spawn(async move {
                if let Err(e) = server::serve(options, router, stop, force).await {
                    tracing::error!(port, "server failed to start: {e:#}");
                }
            }));
        }

        let keepalive = shared
            .ws
            .spawn_keepalive(config.keep_alive_interval, stop.child_token());

        Ok(Protocols {
            shared,
            stop,
            force,
            servers,
            keepalive,
        })
    }

    /// Stop accepting, drain or destroy connections, and wait the listeners
    /// out. Graceful waits for peers; non-graceful hard-destroys whatever is
    /// still open five seconds after requesting end.
    pub async fn shutdown(self, graceful: bool) {
        self.stop.cancel();
        if graceful {
            self.shared.ws.shutdown(true).await;
        } else {
            // The grace clock starts at the shutdown request, not after the
            // WebSocket layer has finished its own 5 second countdown.
            let grace = tokio::time::sleep(std::time::Duration::from_secs(5));
            self.shared.ws.shutdown(false).await;
            grace.await;
            self.force.cancel();
        }
        for server in self.servers {
            let _ = server.await;
        }
        self.keepalive.abort();
    }
}
