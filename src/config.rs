use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read once at startup from `SLOTBOOK_*` environment variables.
/// Unparseable numbers fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login name of the directory operator; every other login is a user id.
    pub operator: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            operator: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_timeout: Duration::from_millis(2000),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "SLOTBOOK_PORT").unwrap_or(defaults.port),
            bind: lookup("SLOTBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("SLOTBOOK_PASSWORD").unwrap_or(defaults.password),
            operator: lookup("SLOTBOOK_OPERATOR").unwrap_or(defaults.operator),
            max_connections: parsed(&lookup, "SLOTBOOK_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            lock_timeout: parsed(&lookup, "SLOTBOOK_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            metrics_port: parsed(&lookup, "SLOTBOOK_METRICS_PORT"),
            tls_cert: lookup("SLOTBOOK_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("SLOTBOOK_TLS_KEY").map(PathBuf::from),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]);
        assert_eq!(c, Config::default());
        assert_eq!(c.addr(), "0.0.0.0:5433");
        assert_eq!(c.lock_timeout, Duration::from_secs(2));
        assert!(c.metrics_port.is_none());
    }

    #[test]
    fn reads_overrides() {
        let c = config(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_BIND", "127.0.0.1"),
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_OPERATOR", "admin"),
            ("SLOTBOOK_LOCK_TIMEOUT_MS", "250"),
            ("SLOTBOOK_METRICS_PORT", "9090"),
            ("SLOTBOOK_MAX_CONNECTIONS", "64"),
            ("SLOTBOOK_COMPACT_THRESHOLD", " 50 "),
            ("SLOTBOOK_TLS_CERT", "cert.pem"),
        ]);
        assert_eq!(c.addr(), "127.0.0.1:6000");
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/slotbook"));
        assert_eq!(c.operator, "admin");
        assert_eq!(c.lock_timeout, Duration::from_millis(250));
        assert_eq!(c.metrics_port, Some(9090));
        assert_eq!(c.max_connections, 64);
        assert_eq!(c.compact_threshold, 50);
        assert_eq!(c.tls_cert, Some(PathBuf::from("cert.pem")));
        assert!(c.tls_key.is_none());
    }

    #[test]
    fn garbage_numbers_fall_back() {
        let c = config(&[
            ("SLOTBOOK_PORT", "http"),
            ("SLOTBOOK_MAX_CONNECTIONS", "-3"),
            ("SLOTBOOK_COMPACT_THRESHOLD", ""),
        ]);
        assert_eq!(c.port, 5433);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
    }
}
