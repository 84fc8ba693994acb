//! One worker process: database pool, notification listener, metrics sync,
//! verb registry, and the protocol servers.
//!
//! Workers exit 0 after a clean drain, 2 on a fatal error (via the panic
//! hook), and in `[50, 60)` when startup failed in a way worth a respawn
//! cool-down (an unreachable database, typically).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use validana_client_api::dispatcher::Dispatcher;
use validana_client_api::handlers::basics::Basics;
use validana_client_api::ws::WsRegistry;
use validana_client_api::{ApiShared, Protocols};
use validana_core::cache::{self, Cache};
use validana_core::config::Config;
use validana_core::db::{listener, Database};
use validana_core::hub::TransactionHubs;
use validana_core::metrics::export::MetricsExporter;
use validana_core::metrics::{sync as metrics_sync, Metrics};
use validana_core::{startup, util};

/// Stay-down exit for startup failures; the master cools down 30 s.
const EXIT_STARTUP_FAILED: u8 = 51;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

pub fn main(config_path: Option<PathBuf>, worker_id: &str) -> ExitCode {
    let Ok(worker_id) = worker_id.parse::<i32>() else {
        eprintln!("invalid {} value `{worker_id}`", crate::supervisor::WORKER_ENV);
        return ExitCode::FAILURE;
    };
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = startup::configure_tracing(&config) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    startup::install_fatal_panic_hook();
    let _sentry = config.sentry_url.as_ref().map(|url| {
        sentry::init((
            url.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(config, worker_id))
}

async fn run(config: Arc<Config>, worker_id: i32) -> ExitCode {
    tracing::info!(worker_id, "worker starting");

    let db = match Database::new(&config) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("database pool setup failed: {e:#}");
            return ExitCode::from(EXIT_STARTUP_FAILED);
        }
    };
    if let Err(e) = db.check().await {
        tracing::error!("database is unreachable: {e:#}");
        return ExitCode::from(EXIT_STARTUP_FAILED);
    }

    cache::global().set_enabled(config.caching);
    let basics_cache = Cache::new("basics", None);
    basics_cache.set_enabled(config.caching);

    let hubs = TransactionHubs::new();
    let metrics = Metrics::shared();
    let exporter = MetricsExporter::new(db.clone(), config.metrics_interval > 0);

    let background = CancellationToken::new();
    let listener_task = listener::spawn(
        config.clone(),
        db.clone(),
        hubs.clone(),
        background.child_token(),
    );
    let sync_task = metrics_sync::spawn(
        config.clone(),
        db.clone(),
        metrics.clone(),
        worker_id,
        background.child_token(),
    );

    let mut dispatcher = Dispatcher::new();
    Basics {
        config: config.clone(),
        db: db.clone(),
        hubs: hubs.clone(),
        cache: basics_cache,
        exporter,
    }
    .register(&mut dispatcher, "v1");

    let shared = Arc::new(ApiShared {
        config: config.clone(),
        dispatcher: Arc::new(dispatcher),
        metrics: metrics.clone(),
        ws: WsRegistry::new(metrics.clone()),
    });
    let protocols = match Protocols::start(shared) {
        Ok(protocols) => protocols,
        Err(e) => {
            tracing::error!("failed to start protocols: {e:#}");
            return ExitCode::from(EXIT_STARTUP_FAILED);
        }
    };

    let heartbeat = tokio::spawn(heartbeat_loop());

    let graceful = wait_for_shutdown().await;
    tracing::info!(worker_id, graceful, "worker shutting down");

    background.cancel();
    protocols.shutdown(graceful).await;
    let _ = listener_task.await;
    if let Some(sync_task) = sync_task {
        let _ = sync_task.await;
    }
    heartbeat.abort();
    db.close();

    tracing::info!(worker_id, "worker exited cleanly");
    ExitCode::SUCCESS
}

/// Tell the master we are alive, on the stdout pipe reserved for exactly
/// this.
async fn heartbeat_loop() {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        println!("{}", serde_json::json!({ "memory": util::resident_memory_mb() }));
    }
}

/// SIGINT drains gracefully, SIGTERM drops connections after the grace
/// period.
async fn wait_for_shutdown() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("cannot install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => true,
            _ = sigterm.recv() => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        true
    }
}
