//! The listening server: one TCP socket, plain or TLS.
//!
//! TLS key and certificate are read at construction; afterwards the
//! certificate file is watched and both files re-read after a five second
//! debounce, hot-swapping the acceptor config. A certificate that fails to
//! parse keeps the previous context. Listener failures restart the socket
//! under an exponential back-off, unless the shutdown token has fired.

use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use arc_swap::ArcSwap;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use notify::{RecursiveMode, Watcher};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Idle sockets are dropped if no request byte arrives within this window.
const PRE_REQUEST_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);
const CERT_RELOAD_DEBOUNCE: Duration = Duration::from_secs(5);

pub struct TlsPaths {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

pub struct ServerOptions {
    pub port: u16,
    pub tls: Option<TlsPaths>,
}

/// Check the key pair parses before any listener spawns; a bad path should
/// fail worker startup, not log from a background task.
pub fn validate_tls(paths: &TlsPaths) -> anyhow::Result<()> {
    load_tls_config(&paths.key_path, &paths.cert_path).map(|_| ())
}

/// Run one listening socket until `stop` fires. `stop` ends accepting and
/// asks open connections to drain; `force` (fired five seconds after a
/// non-graceful shutdown request) destroys whatever is still open. Only the
/// initial TLS load can fail; everything later restarts under the back-off
/// schedule.
pub async fn serve(
    options: ServerOptions,
    router: Router,
    stop: CancellationToken,
    force: CancellationToken,
) -> anyhow::Result<()> {
    let mut watcher = None;
    let tls = match &options.tls {
        Some(paths) => {
            let config = load_tls_config(&paths.key_path, &paths.cert_path)
                .context("failed to load TLS key/certificate")?;
            let shared = Arc::new(ArcSwap::from_pointee(config));
            watcher = Some(spawn_cert_watcher(shared.clone(), paths)?);
            Some(shared)
        }
        None => None,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], options.port));
    let service = TowerToHyperService::new(router);
    let mut retry_delay = INITIAL_RETRY_DELAY;

    'rebind: loop {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => {
                retry_delay = INITIAL_RETRY_DELAY;
                listener
            }
            Err(e) => {
                tracing::warn!("failed to listen on {addr}: {e}; retrying in {retry_delay:?}");
                if wait_or_stop(retry_delay, &stop).await {
                    break;
                }
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                continue;
            }
        };
        tracing::info!(%addr, tls = tls.is_some(), "server listening");

        loop {
            tokio::select! {
                _ = stop.cancelled() => break 'rebind,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            peer,
                            tls.clone(),
                            service.clone(),
                            stop.clone(),
                            force.clone(),
                        ));
                    }
                    Err(e) => {
                        // Close the socket and retry under the same schedule.
                        tracing::warn!("accept failed on {addr}: {e}; rebinding in {retry_delay:?}");
                        drop(listener);
                        if wait_or_stop(retry_delay, &stop).await {
                            break 'rebind;
                        }
                        retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                        continue 'rebind;
                    }
                }
            }
        }
    }

    drop(watcher);
    Ok(())
}

/// True if shutdown fired during the wait.
async fn wait_or_stop(delay: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.cancelled() => true,
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<Arc<ArcSwap<rustls::ServerConfig>>>,
    service: TowerToHyperService<Router>,
    stop: CancellationToken,
    force: CancellationToken,
) {
    let stream = IdleTimeout::new(stream, PRE_REQUEST_IDLE_TIMEOUT);
    match tls {
        Some(tls) => {
            let acceptor = TlsAcceptor::from(tls.load_full());
            match acceptor.accept(stream).await {
                Ok(stream) => serve_stream(stream, peer, service, stop, force).await,
                Err(e) => tracing::debug!(%peer, "tls handshake failed: {e}"),
            }
        }
        None => serve_stream(stream, peer, service, stop, force).await,
    }
}

async fn serve_stream<S>(
    stream: S,
    peer: SocketAddr,
    service: TowerToHyperService<Router>,
    stop: CancellationToken,
    force: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(%peer, "connection ended with error: {e}");
                }
                return;
            }
            _ = stop.cancelled(), if !draining => {
                // Finish the in-flight request, then close.
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
            _ = force.cancelled() => {
                // Non-graceful shutdown ran out of grace; dropping the
                // connection destroys the socket.
                tracing::debug!(%peer, "destroying connection on non-graceful shutdown");
                return;
            }
        }
    }
}

fn load_tls_config(key_path: &Path, cert_path: &Path) -> anyhow::Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        std::fs::File::open(cert_path)
            .with_context(|| format!("cannot open certificate {}", cert_path.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("cannot parse certificate")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        std::fs::File::open(key_path)
            .with_context(|| format!("cannot open private key {}", key_path.display()))?,
    ))
    .context("cannot parse private key")?
    .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS key/certificate pair")
}

/// Watch the certificate file; on modification, after the debounce, re-read
/// both files and swap the config. Returns the watcher, which must be kept
/// alive for the watch to stay registered.
fn spawn_cert_watcher(
    shared: Arc<ArcSwap<rustls::ServerConfig>>,
    paths: &TlsPaths,
) -> anyhow::Result<notify::RecommendedWatcher> {
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if event.is_ok() {
            let _ = tx.send(());
        }
    })
    .context("failed to create certificate watcher")?;
    watcher
        .watch(&paths.cert_path, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", paths.cert_path.display()))?;

    let key_path = paths.key_path.clone();
    let cert_path = paths.cert_path.clone();
    tokio::task::spawn_blocking(move || {
        while rx.recv().is_ok() {
            // Absorb the burst of events a certificate rollover produces.
            while rx.recv_timeout(CERT_RELOAD_DEBOUNCE).is_ok() {}
            match load_tls_config(&key_path, &cert_path) {
                Ok(config) => {
                    shared.store(Arc::new(config));
                    tracing::info!("reloaded TLS certificate");
                }
                Err(e) => {
                    tracing::warn!("certificate reload failed, keeping previous context: {e:#}");
                }
            }
        }
    });
    Ok(watcher)
}

/// Errors the read side if no byte arrives before the deadline; disarms
/// permanently once the first byte shows up. The timer is boxed so the
/// wrapper stays `Unpin` for the TLS acceptor and hyper.
struct IdleTimeout<S> {
    inner: S,
    sleep: Pin<Box<tokio::time::Sleep>>,
    armed: bool,
}

impl<S> IdleTimeout<S> {
    fn new(inner: S, timeout: Duration) -> IdleTimeout<S> {
        IdleTimeout {
            inner,
            sleep: Box::pin(tokio::time::sleep(timeout)),
            armed: true,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.armed {
            if let Poll::Ready(()) = std::future::Future::poll(this.sleep.as_mut(), cx) {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no request within the idle timeout",
                )));
            }
        }
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.armed = false;
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
