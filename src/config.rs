use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::AdmissionSettings;
use crate::retry::RetryPolicy;

/// Server settings, read from `RENTD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub admission: AdmissionSettings,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        fn or<T: FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }

        let attempts = or(lookup("RENTD_ADMISSION_ATTEMPTS"), 5u32);
        let backoff = parsed("RENTD_ADMISSION_BACKOFF_MS").unwrap_or(5);
        let max_backoff = parsed("RENTD_ADMISSION_MAX_BACKOFF_MS").unwrap_or(100);
        let timeout = parsed("RENTD_ADMISSION_TIMEOUT_MS").unwrap_or(2_000);

        Self {
            bind: lookup("RENTD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: or(lookup("RENTD_PORT"), 5433),
            data_dir: PathBuf::from(lookup("RENTD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("RENTD_PASSWORD").unwrap_or_else(|| "rentd".into()),
            max_connections: or(lookup("RENTD_MAX_CONNECTIONS"), 256),
            compact_threshold: or(lookup("RENTD_COMPACT_THRESHOLD"), 1000),
            tls_cert: lookup("RENTD_TLS_CERT"),
            tls_key: lookup("RENTD_TLS_KEY"),
            metrics_port: lookup("RENTD_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            admission: AdmissionSettings {
                retry: RetryPolicy::new(
                    attempts,
                    Duration::from_millis(backoff),
                    Duration::from_millis(max_backoff),
                    RetryPolicy::default().jitter_pct,
                ),
                timeout: Duration::from_millis(timeout),
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
