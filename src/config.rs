use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `CABINBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "cabinbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        Self {
            port: parsed(&lookup, "CABINBOOK_PORT").unwrap_or(defaults.port),
            bind: lookup("CABINBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("CABINBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("CABINBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "CABINBOOK_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "CABINBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("CABINBOOK_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("CABINBOOK_TLS_KEY").map(PathBuf::from),
            metrics_port: parsed(&lookup, "CABINBOOK_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("cabinbook.wal")
    }
}
