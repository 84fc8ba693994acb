//! Process-wide configuration.
//!
//! Settings are assembled from three sources, lowest to highest precedence:
//! hard-coded defaults, a single JSON document given as the last command
//! line argument (read by the master, handed to workers through the
//! environment), and `VSERVER_*` environment variables. Every key is typed
//! and validated here; a missing or ill-typed required key aborts startup.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

/// Environment variable prefix shared by every recognised key.
const PREFIX: &str = "VSERVER_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read config file {0}: {1}")]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Config file {0} does not parse as JSON: {1}")]
    FileParse(PathBuf, #[source] serde_json::Error),
    #[error("Config file {0} must contain a single JSON object")]
    FileNotObject(PathBuf),
    #[error("Missing required config key {0}{1}")]
    Missing(&'static str, &'static str),
    #[error("Invalid value for config key {PREFIX}{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("Unknown environment variable {0}")]
    UnknownEnv(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Typed, validated settings for one gateway process.
#[derive(Clone, Debug)]
pub struct Config {
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_min_connections: u32,
    pub db_max_connections: u32,
    pub http_port: u16,
    pub ws_port: u16,
    pub tls: bool,
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    /// Maximum request payload in bytes; 0 means unlimited.
    pub max_payload_size: usize,
    /// WebSocket keep-alive interval in seconds.
    pub keep_alive_interval: u64,
    /// Maximum worker memory in MB before the supervisor recycles it; 0 = unlimited.
    pub max_memory_mb: u64,
    /// Metrics sync interval in seconds; 0 disables metrics gathering.
    pub metrics_interval: u64,
    pub metrics_token: Option<String>,
    /// Negative or zero: subtract from the detected CPU count. Positive: absolute.
    pub workers: i32,
    pub log_level: String,
    pub log_format: LogFormat,
    pub caching: bool,
    pub sentry_url: Option<String>,
}

/// The recognised keys, used to reject unknown `VSERVER_*` variables.
const KNOWN_KEYS: &[&str] = &[
    "DBUSER",
    "DBPASSWORD",
    "DBNAME",
    "DBHOST",
    "DBPORT",
    "DBMINCONNECTIONS",
    "DBMAXCONNECTIONS",
    "HTTPPORT",
    "WSPORT",
    "TLS",
    "KEYPATH",
    "CERTPATH",
    "MAXPAYLOADSIZE",
    "TIMEOUT",
    "MAXMEMORY",
    "METRICSINTERVAL",
    "METRICSTOKEN",
    "WORKERS",
    "LOGLEVEL",
    "LOGFORMAT",
    "CACHING",
    "SENTRYURL",
];

/// Raw string values merged from file and environment, keyed without prefix.
struct Sources {
    values: HashMap<String, String>,
}

impl Sources {
    fn gather(file: Option<&Path>) -> Result<Sources, ConfigError> {
        let mut values = HashMap::new();

        if let Some(path) = file {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.to_owned(), e))?;
            let doc: Value = serde_json::from_str(&text)
                .map_err(|e| ConfigError::FileParse(path.to_owned(), e))?;
            let Value::Object(map) = doc else {
                return Err(ConfigError::FileNotObject(path.to_owned()));
            };
            for (key, value) in map {
                let Some(name) = key.strip_prefix(PREFIX) else {
                    tracing::warn!(key, "ignoring config file key without {PREFIX} prefix");
                    continue;
                };
                if !KNOWN_KEYS.contains(&name) {
                    tracing::warn!(key, "ignoring unknown config file key");
                    continue;
                }
                let text = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => other.to_string(),
                };
                values.insert(name.to_owned(), text);
            }
        }

        // Environment overrides the file.
        for (key, value) in env::vars() {
            let Some(name) = key.strip_prefix(PREFIX) else {
                continue;
            };
            if !KNOWN_KEYS.contains(&name) {
                return Err(ConfigError::UnknownEnv(key));
            }
            values.insert(name.to_owned(), value);
        }

        Ok(Sources { values })
    }

    fn string(&self, key: &'static str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.string(key).ok_or(ConfigError::Missing(PREFIX, key))
    }

    fn parsed<T: std::str::FromStr>(
        &self,
        key: &'static str,
        default: T,
        what: &str,
    ) -> Result<T, ConfigError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key,
                reason: format!("expected {what}, got `{raw}`"),
            }),
        }
    }

    fn boolean(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.values.get(key).map(|s| s.as_str()) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(raw) => Err(ConfigError::Invalid {
                key,
                reason: format!("expected true or false, got `{raw}`"),
            }),
        }
    }
}

impl Config {
    /// Load and validate the configuration. `file` is the JSON document given
    /// as the last command line argument, if any.
    pub fn load(file: Option<&Path>) -> Result<Config, ConfigError> {
        let src = Sources::gather(file)?;

        let config = Config {
            db_user: src.required("DBUSER")?,
            db_password: src.required("DBPASSWORD")?,
            db_name: src.required("DBNAME")?,
            db_host: src.string("DBHOST").unwrap_or_else(|| "localhost".to_owned()),
            db_port: src.parsed("DBPORT", 5432, "a port number")?,
            db_min_connections: src.parsed("DBMINCONNECTIONS", 0, "a connection count")?,
            db_max_connections: src.parsed("DBMAXCONNECTIONS", 10, "a connection count")?,
            http_port: src.parsed("HTTPPORT", 8080, "a port number")?,
            ws_port: src.parsed("WSPORT", 8080, "a port number")?,
            tls: src.boolean("TLS", false)?,
            key_path: src.string("KEYPATH").map(PathBuf::from),
            cert_path: src.string("CERTPATH").map(PathBuf::from),
            max_payload_size: src.parsed("MAXPAYLOADSIZE", 1_000_000, "a byte count")?,
            keep_alive_interval: src.parsed("TIMEOUT", 60, "a number of seconds")?,
            max_memory_mb: src.parsed("MAXMEMORY", 0, "a number of megabytes")?,
            metrics_interval: src.parsed("METRICSINTERVAL", 0, "a number of seconds")?,
            metrics_token: src.string("METRICSTOKEN"),
            workers: src.parsed("WORKERS", -1, "an integer")?,
            log_level: src.string("LOGLEVEL").unwrap_or_else(|| "info".to_owned()),
            log_format: match src.string("LOGFORMAT").as_deref() {
                None | Some("text") => LogFormat::Text,
                Some("json") => LogFormat::Json,
                Some(raw) => {
                    return Err(ConfigError::Invalid {
                        key: "LOGFORMAT",
                        reason: format!("expected text or json, got `{raw}`"),
                    })
                }
            },
            caching: src.boolean("CACHING", true)?,
            sentry_url: src.string("SENTRYURL"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_alive_interval < 5 {
            return Err(ConfigError::Invalid {
                key: "TIMEOUT",
                reason: format!("must be at least 5 seconds, got {}", self.keep_alive_interval),
            });
        }
        if self.max_memory_mb != 0 && self.max_memory_mb < 50 {
            return Err(ConfigError::Invalid {
                key: "MAXMEMORY",
                reason: format!("must be 0 (unlimited) or at least 50 MB, got {}", self.max_memory_mb),
            });
        }
        if self.metrics_interval > 3600 {
            return Err(ConfigError::Invalid {
                key: "METRICSINTERVAL",
                reason: format!("must be at most 3600 seconds, got {}", self.metrics_interval),
            });
        }
        if self.db_min_connections > self.db_max_connections {
            return Err(ConfigError::Invalid {
                key: "DBMINCONNECTIONS",
                reason: format!(
                    "must not exceed DBMAXCONNECTIONS ({} > {})",
                    self.db_min_connections, self.db_max_connections
                ),
            });
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "DBMAXCONNECTIONS",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.tls {
            match (&self.key_path, &self.cert_path) {
                (Some(key), Some(cert)) => {
                    for (name, path) in [("KEYPATH", key), ("CERTPATH", cert)] {
                        if !path.is_file() {
                            return Err(ConfigError::Invalid {
                                key: if name == "KEYPATH" { "KEYPATH" } else { "CERTPATH" },
                                reason: format!("{} is not a readable file", path.display()),
                            });
                        }
                    }
                }
                (None, _) => {
                    return Err(ConfigError::Missing(PREFIX, "KEYPATH"));
                }
                (_, None) => {
                    return Err(ConfigError::Missing(PREFIX, "CERTPATH"));
                }
            }
        }
        Ok(())
    }

    /// Resolve the configured worker count against the number of CPUs.
    /// Zero or negative values subtract from the CPU count; the result is
    /// never below one.
    pub fn resolved_workers(&self) -> usize {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        if self.workers > 0 {
            self.workers as usize
        } else {
            cpus.saturating_sub(self.workers.unsigned_abs() as usize).max(1)
        }
    }

    /// HTTP and WebSocket share one listening socket when their ports match.
    pub fn shared_port(&self) -> bool {
        self.http_port == self.ws_port
    }

    /// Connection string for `tokio_postgres`.
    pub fn db_connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.db_host, self.db_port, self.db_user, self.db_password, self.db_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    // Env manipulation is process-global; tests touching it run under this lock.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    fn base_file(extra: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"VSERVER_DBUSER": "gw", "VSERVER_DBPASSWORD": "secret", "VSERVER_DBNAME": "blockchain"{}}}"#,
            extra
        )
        .unwrap();
        f
    }

    #[test]
    fn defaults_apply_when_file_and_env_are_silent() {
        let _guard = ENV_LOCK.lock();
        let f = base_file("");
        let config = Config::load(Some(f.path())).unwrap();
        assert_eq!(config.db_port, 5432);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.ws_port, 8080);
        assert_eq!(config.max_payload_size, 1_000_000);
        assert_eq!(config.keep_alive_interval, 60);
        assert_eq!(config.workers, -1);
        assert!(config.caching);
        assert!(!config.tls);
        assert!(config.shared_port());
    }

    #[test]
    fn environment_overrides_file() {
        let _guard = ENV_LOCK.lock();
        let f = base_file(r#", "VSERVER_HTTPPORT": 9000"#);
        std::env::set_var("VSERVER_HTTPPORT", "9001");
        let config = Config::load(Some(f.path()));
        std::env::remove_var("VSERVER_HTTPPORT");
        assert_eq!(config.unwrap().http_port, 9001);
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let _guard = ENV_LOCK.lock();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"VSERVER_DBUSER": "gw"}}"#).unwrap();
        let err = Config::load(Some(f.path())).unwrap_err();
        assert!(err.to_string().contains("VSERVER_DBPASSWORD"), "{err}");
    }

    #[test]
    fn wrong_typed_key_is_fatal() {
        let _guard = ENV_LOCK.lock();
        let f = base_file(r#", "VSERVER_DBPORT": "not-a-port""#);
        let err = Config::load(Some(f.path())).unwrap_err();
        assert!(err.to_string().contains("VSERVER_DBPORT"), "{err}");
    }

    #[test]
    fn keep_alive_minimum_enforced() {
        let _guard = ENV_LOCK.lock();
        let f = base_file(r#", "VSERVER_TIMEOUT": 3"#);
        let err = Config::load(Some(f.path())).unwrap_err();
        assert!(err.to_string().contains("at least 5"), "{err}");
    }

    #[test]
    fn max_memory_floor_enforced() {
        let _guard = ENV_LOCK.lock();
        let f = base_file(r#", "VSERVER_MAXMEMORY": 20"#);
        assert!(Config::load(Some(f.path())).is_err());
        let f = base_file(r#", "VSERVER_MAXMEMORY": 0"#);
        assert_eq!(Config::load(Some(f.path())).unwrap().max_memory_mb, 0);
    }

    #[test]
    fn unknown_env_key_is_rejected() {
        let _guard = ENV_LOCK.lock();
        let f = base_file("");
        std::env::set_var("VSERVER_NOSUCHKEY", "1");
        let err = Config::load(Some(f.path())).unwrap_err();
        std::env::remove_var("VSERVER_NOSUCHKEY");
        assert!(matches!(err, ConfigError::UnknownEnv(_)));
    }

    #[test]
    fn worker_count_resolution() {
        let _guard = ENV_LOCK.lock();
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        let f = base_file(r#", "VSERVER_WORKERS": 4"#);
        assert_eq!(Config::load(Some(f.path())).unwrap().resolved_workers(), 4);

        let f = base_file(r#", "VSERVER_WORKERS": -1"#);
        assert_eq!(
            Config::load(Some(f.path())).unwrap().resolved_workers(),
            cpus.saturating_sub(1).max(1)
        );

        // Subtracting more workers than there are CPUs still yields one.
        let f = base_file(r#", "VSERVER_WORKERS": -1024"#);
        assert_eq!(Config::load(Some(f.path())).unwrap().resolved_workers(), 1);
    }

    #[test]
    fn tls_requires_key_and_cert() {
        let _guard = ENV_LOCK.lock();
        let f = base_file(r#", "VSERVER_TLS": true"#);
        let err = Config::load(Some(f.path())).unwrap_err();
        assert!(err.to_string().contains("KEYPATH"), "{err}");
    }
}
