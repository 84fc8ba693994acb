//! Tracing setup and process-fatal error handling.
//!
//! All log output flows through a scrubbing writer that removes the
//! configured database password before a line reaches the sink, so no call
//! site has to remember to sanitise an error it logs.

use std::io::{self, Write};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};

/// Replaces every occurrence of `secret` in the written bytes with nothing.
pub struct ScrubWriter<W> {
    inner: W,
    secret: Option<Vec<u8>>,
}

impl<W: Write> ScrubWriter<W> {
    pub fn new(inner: W, secret: Option<&str>) -> Self {
        // A short secret would shred unrelated output, and an empty one
        // would loop; scrubbing only applies to plausible passwords.
        let secret = secret.filter(|s| s.len() >= 2).map(|s| s.as_bytes().to_vec());
        Self { inner, secret }
    }
}

impl<W: Write> Write for ScrubWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.secret {
            None => self.inner.write(buf),
            Some(secret) => {
                let mut rest = buf;
                while let Some(at) = find(rest, secret) {
                    self.inner.write_all(&rest[..at])?;
                    rest = &rest[at + secret.len()..];
                }
                self.inner.write_all(rest)?;
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `MakeWriter` handing out scrubbing writers over stderr. Worker stdout is
/// reserved for the supervisor heartbeat protocol.
#[derive(Clone)]
pub struct ScrubMakeWriter {
    secret: Option<String>,
}

impl ScrubMakeWriter {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret.map(str::to_owned),
        }
    }
}

impl<'a> MakeWriter<'a> for ScrubMakeWriter {
    type Writer = ScrubWriter<io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        ScrubWriter::new(io::stderr(), self.secret.as_deref())
    }
}

/// Install the global tracing subscriber according to the configured log
/// level and format. Idempotent so tests can call it repeatedly.
pub fn configure_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| anyhow::anyhow!("invalid VSERVER_LOGLEVEL `{}`: {e}", config.log_level))?;
    let writer = ScrubMakeWriter::new(Some(&config.db_password));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false);
    let result = match config.log_format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    // Already-set means a test harness beat us to it; that is fine.
    let _ = result;
    Ok(())
}

thread_local! {
    static CATCH_DEPTH: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Marks a region whose panics are caught and survived; the event hub
/// isolates subscriber callbacks this way. The fatal hook leaves those to
/// their catcher instead of taking the worker down.
pub struct CatchScope(());

pub fn catch_scope() -> CatchScope {
    CATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
    CatchScope(())
}

impl Drop for CatchScope {
    fn drop(&mut self) {
        CATCH_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

fn in_catch_scope() -> bool {
    CATCH_DEPTH.with(|depth| depth.get() > 0)
}

/// Treat any uncaught panic as an infrastructure error: log it (scrubbed,
/// through the subscriber installed above) and exit with code 2 so the
/// supervisor respawns the worker. Panics inside a [`catch_scope`] are not
/// fatal; whoever catches them reports them.
pub fn install_fatal_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if in_catch_scope() {
            return;
        }
        tracing::error!("fatal error, shutting down worker: {info}");
        default(info);
        std::process::exit(2);
    }));
}
