//! The master process: spawns worker processes, watches their heartbeats
//! and memory, and respawns them under the exit-code policy.
//!
//! Workers report `{"memory": <mb>}` lines on stdout every five seconds
//! (their logs go to stderr). Three consecutive missed heartbeats, or a
//! report above the configured memory limit, earn the worker a graceful
//! shutdown request (SIGINT), followed by a hard kill ten seconds later if
//! it lingers. Exit codes in `[50, 60)` mean "stay down briefly" and delay
//! the respawn by thirty seconds; any other unexpected exit respawns after
//! one second.

use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;

use validana_core::config::Config;
use validana_core::startup;

pub const WORKER_ENV: &str = "VALIDANA_WORKER_ID";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const MAX_MISSED_HEARTBEATS: u32 = 3;
const KILL_GRACE: Duration = Duration::from_secs(10);
const RESPAWN_DELAY: Duration = Duration::from_secs(1);
const COOLDOWN_DELAY: Duration = Duration::from_secs(30);

/// Exit codes workers use to ask for a respawn cool-down.
pub fn is_cooldown_exit(code: i32) -> bool {
    (50..60).contains(&code)
}

pub fn respawn_delay(code: i32) -> Duration {
    if is_cooldown_exit(code) {
        COOLDOWN_DELAY
    } else {
        RESPAWN_DELAY
    }
}

#[derive(Debug, Deserialize)]
struct Heartbeat {
    memory: u64,
}

/// `None` while running; `Some(graceful)` once shutdown has been requested.
type ShutdownSignal = watch::Receiver<Option<bool>>;

pub fn main(config_path: Option<PathBuf>) -> ExitCode {
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
    runtime.block_on(run(config, config_path))
}

async fn run(config: Arc<Config>, config_path: Option<PathBuf>) -> ExitCode {
    let worker_count = config.resolved_workers();
    tracing::info!(workers = worker_count, "master starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(None::<bool>);
    tokio::spawn(watch_signals(shutdown_tx));

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            tracing::error!("cannot locate own executable: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut slots = JoinSet::new();
    for worker_id in 0..worker_count {
        slots.spawn(worker_slot(
            worker_id,
            config.clone(),
            exe.clone(),
            config_path.clone(),
            shutdown_rx.clone(),
        ));
    }
    while slots.join_next().await.is_some() {}

    let graceful = *shutdown_rx.borrow() == Some(true);
    tracing::info!(graceful, "master exiting");
    if graceful {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// SIGINT asks for a graceful drain; SIGTERM for a hard stop.
async fn watch_signals(shutdown_tx: watch::Sender<Option<bool>>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("cannot install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
        let graceful = tokio::select! {
            _ = sigint.recv() => true,
            _ = sigterm.recv() => false,
        };
        tracing::info!(graceful, "shutdown requested, stopping workers");
        let _ = shutdown_tx.send(Some(graceful));
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(Some(true));
    }
}

/// Keep one worker slot occupied until shutdown: spawn, monitor, respawn.
async fn worker_slot(
    worker_id: usize,
    config: Arc<Config>,
    exe: PathBuf,
    config_path: Option<PathBuf>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        if shutdown.borrow().is_some() {
            return;
        }

        let mut command = Command::new(&exe);
        command
            .arg("start")
            .env(WORKER_ENV, worker_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(path) = &config_path {
            command.arg(path);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(worker_id, "failed to spawn worker: {e}");
                if wait_or_shutdown(COOLDOWN_DELAY, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };
        tracing::info!(worker_id, pid = child.id(), "worker started");

        let code = monitor(worker_id, child, &config, &mut shutdown).await;
        if shutdown.borrow().is_some() {
            tracing::info!(worker_id, code, "worker exited during shutdown");
            return;
        }

        tracing::warn!(worker_id, code, "worker exited, respawning");
        if wait_or_shutdown(respawn_delay(code), &mut shutdown).await {
            return;
        }
    }
}

/// True if shutdown was requested during the wait.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut ShutdownSignal) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

#[cfg(unix)]
fn send_signal(child: &Child, graceful: bool) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let Some(pid) = child.id() else { return };
    let signal = if graceful { Signal::SIGINT } else { Signal::SIGTERM };
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        tracing::warn!(pid, "failed to signal worker: {e}");
    }
}

#[cfg(not(unix))]
fn send_signal(_child: &Child, _graceful: bool) {}

/// Watch one worker until it exits; returns its exit code. Requests a
/// shutdown on missed heartbeats, excessive memory, or a master-wide
/// shutdown, and hard-kills after the grace period.
async fn monitor(
    worker_id: usize,
    mut child: Child,
    config: &Config,
    shutdown: &mut ShutdownSignal,
) -> i32 {
    let stdout = child.stdout.take().expect("worker stdout is piped");
    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;

    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await;
    let mut beat_in_period = true; // the spawn itself counts as the first sign of life
    let mut missed: u32 = 0;

    // Parked far in the future until a shutdown request arms it.
    let mut kill_at = Box::pin(tokio::time::sleep(Duration::from_secs(86_400)));
    let mut kill_armed = false;
    let mut signalled = false;
    let mut request_stop: Option<bool> = None;

    loop {
        if let Some(graceful) = request_stop.take() {
            if !signalled {
                signalled = true;
                send_signal(&child, graceful);
                kill_at
                    .as_mut()
                    .reset(tokio::time::Instant::now() + KILL_GRACE);
                kill_armed = true;
            }
        }

        let mut hard_kill = false;
        tokio::select! {
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                return code;
            }
            line = lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => match serde_json::from_str::<Heartbeat>(&line) {
                    Ok(beat) => {
                        beat_in_period = true;
                        missed = 0;
                        if config.max_memory_mb > 0 && beat.memory > config.max_memory_mb {
                            tracing::warn!(
                                worker_id,
                                memory = beat.memory,
                                limit = config.max_memory_mb,
                                "worker over memory limit, recycling"
                            );
                            request_stop = Some(true);
                        }
                    }
                    Err(_) => tracing::debug!(worker_id, line, "ignoring malformed heartbeat"),
                },
                Ok(None) | Err(_) => stdout_open = false,
            },
            _ = ticker.tick() => {
                if !beat_in_period {
                    missed += 1;
                    if missed >= MAX_MISSED_HEARTBEATS && !signalled {
                        tracing::warn!(worker_id, missed, "worker stopped heartbeating, recycling");
                        request_stop = Some(true);
                    }
                }
                beat_in_period = false;
            }
            changed = shutdown.changed(), if !signalled => {
                if changed.is_ok() {
                    let graceful = shutdown.borrow().unwrap_or(true);
                    request_stop = Some(graceful);
                }
            }
            _ = kill_at.as_mut(), if kill_armed => {
                hard_kill = true;
                kill_armed = false;
            }
        }
        if hard_kill {
            tracing::warn!(worker_id, "worker ignored shutdown request, killing");
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cooldown_exit_codes_delay_the_respawn() {
        assert!(is_cooldown_exit(50));
        assert!(is_cooldown_exit(59));
        assert!(!is_cooldown_exit(60));
        assert!(!is_cooldown_exit(2));
        assert_eq!(respawn_delay(51), COOLDOWN_DELAY);
        assert_eq!(respawn_delay(1), RESPAWN_DELAY);
        assert_eq!(respawn_delay(2), RESPAWN_DELAY);
    }

    #[test]
    fn heartbeat_lines_parse() {
        let beat: Heartbeat = serde_json::from_str(r#"{"memory": 140}"#).unwrap();
        assert_eq!(beat.memory, 140);
        assert!(serde_json::from_str::<Heartbeat>("log line").is_err());
    }
}
