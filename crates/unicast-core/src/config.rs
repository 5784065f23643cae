//! Centralized configuration for unicast RPC.
//!
//! Constant defaults live on [`RpcDefaults`]; the server and client each take a
//! config struct that can be built in code with `with_*` setters or loaded from
//! a JSON file carrying any subset of the fields.

use crate::error::{Result, RpcError};
use crate::network::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default values shared by servers and clients.
pub struct RpcDefaults;

impl RpcDefaults {
    pub const PROTOCOL_VERSION: &'static str = "2.0";
    pub const RPC_PATH: &'static str = "/post";
    pub const HEALTH_PATH: &'static str = "/health";

    // Dedup cache
    pub const CLEAR_TIMEOUT: Duration = Duration::from_secs(60);

    // Server control loop
    pub const POLL_DELAY: Duration = Duration::from_secs(5);

    // Client
    pub const MONITORING_TIMEOUT: Duration = Duration::from_secs(5);
    pub const FIRST_WAIT: Duration = Duration::from_secs(30);
    pub const NEXT_WAIT: Duration = Duration::from_secs(15);
    pub const POOL_LIMIT: usize = 20;
}

/// TLS material handed to the transport.
///
/// On a server, `cert_file` + `key_file` enable TLS and `ca_file` turns on
/// client certificate verification. On a client, `ca_file` is trusted as a
/// root and `cert_file` + `key_file` are presented as the client identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl TlsConfig {
    /// Whether any TLS material is configured.
    pub fn is_enabled(&self) -> bool {
        self.ca_file.is_some() || self.cert_file.is_some() || self.key_file.is_some()
    }

    /// Whether a certificate/key pair is configured.
    pub fn has_identity(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    /// URL scheme matching this configuration.
    pub fn scheme(&self) -> &'static str {
        if self.is_enabled() {
            "https"
        } else {
            "http"
        }
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn with_identity(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert.into());
        self.key_file = Some(key.into());
        self
    }
}

/// Dedup and dispatch policy for one request store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Residency bound for completed request ids.
    #[serde(with = "duration_ms")]
    pub clear_timeout: Duration,
    /// Treat ids that parse as integers as non-unique and skip dedup for them.
    pub exempt_numeric_ids: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            clear_timeout: RpcDefaults::CLEAR_TIMEOUT,
            exempt_numeric_ids: true,
        }
    }
}

impl DispatchConfig {
    pub fn with_clear_timeout(mut self, timeout: Duration) -> Self {
        self.clear_timeout = timeout;
        self
    }

    pub fn with_exempt_numeric_ids(mut self, exempt: bool) -> Self {
        self.exempt_numeric_ids = exempt;
        self
    }
}

/// A `(host, port)` pair as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceAddr {
    pub host: String,
    pub port: u16,
}

impl InterfaceAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`; IPv6 hosts are written in brackets (`[::1]:9000`).
    pub fn parse(value: &str) -> Result<Self> {
        let (host, port) = value.rsplit_once(':').ok_or_else(|| RpcError::Config {
            message: format!("Expected HOST:PORT, got '{}'", value),
        })?;
        let port = port.parse::<u16>().map_err(|e| RpcError::Config {
            message: format!("Invalid port in '{}': {}", value, e),
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(RpcError::Config {
                message: format!("Missing host in '{}'", value),
            });
        }
        Ok(Self::new(host, port))
    }

    /// Host formatted for use in a URL or socket address string.
    pub fn url_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl std::fmt::Display for InterfaceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.url_host(), self.port)
    }
}

impl<H: Into<String>> From<(H, u16)> for InterfaceAddr {
    fn from((host, port): (H, u16)) -> Self {
        Self::new(host, port)
    }
}

/// Configuration for a multi-interface server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Addresses to listen on at start; more can be added while running.
    pub interfaces: Vec<InterfaceAddr>,
    /// Control loop period, also the default bind retry delay.
    #[serde(with = "duration_ms")]
    pub poll_delay: Duration,
    /// HTTP path accepting POSTed request envelopes.
    pub path: String,
    /// Retry policy for failed binds.
    pub bind_retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            poll_delay: RpcDefaults::POLL_DELAY,
            path: RpcDefaults::RPC_PATH.to_string(),
            bind_retry: RetryConfig::fixed(RpcDefaults::POLL_DELAY),
            dispatch: DispatchConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a server configuration from a JSON file.
    ///
    /// When the file sets `poll_delay` without a `bind_retry` section, failed
    /// binds are retried every poll delay, as with [`with_poll_delay`](Self::with_poll_delay).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = read_json(path)?;
        let explicit_retry = raw.get("bind_retry").is_some();
        let mut config: Self = parse_json(path, raw)?;
        if !explicit_retry {
            config.bind_retry = RetryConfig::fixed(config.poll_delay);
        }
        config.path = normalize_path(config.path);
        Ok(config)
    }

    pub fn with_interface(mut self, interface: impl Into<InterfaceAddr>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Set the poll delay. The bind retry delay follows it unless it was
    /// configured separately afterwards.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self.bind_retry.base_delay = delay;
        self.bind_retry.max_delay = self.bind_retry.max_delay.max(delay);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = normalize_path(path.into());
        self
    }

    pub fn with_bind_retry(mut self, retry: RetryConfig) -> Self {
        self.bind_retry = retry;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }
}

/// Configuration for a multi-interface client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Peer endpoints every call is sent to.
    pub endpoints: Vec<InterfaceAddr>,
    /// HTTP path the peers accept request envelopes on.
    pub path: String,
    /// Idle connections kept per host by each pooled session.
    ///
    /// This bounds reuse, not concurrency: a session still opens as many
    /// connections as there are simultaneous requests to a host.
    pub pool_limit: usize,
    /// Phase length of the session rotation cycle.
    #[serde(with = "duration_ms")]
    pub monitoring_timeout: Duration,
    /// Race window before the first endpoint completes.
    #[serde(with = "duration_ms")]
    pub first_wait: Duration,
    /// Race window after each further completion.
    #[serde(with = "duration_ms")]
    pub next_wait: Duration,
    pub tls: TlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            path: RpcDefaults::RPC_PATH.to_string(),
            pool_limit: RpcDefaults::POOL_LIMIT,
            monitoring_timeout: RpcDefaults::MONITORING_TIMEOUT,
            first_wait: RpcDefaults::FIRST_WAIT,
            next_wait: RpcDefaults::NEXT_WAIT,
            tls: TlsConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a client configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config: Self = parse_json(path, read_json(path)?)?;
        config.path = normalize_path(config.path);
        Ok(config)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<InterfaceAddr>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = normalize_path(path.into());
        self
    }

    pub fn with_pool_limit(mut self, limit: usize) -> Self {
        self.pool_limit = limit;
        self
    }

    pub fn with_monitoring_timeout(mut self, timeout: Duration) -> Self {
        self.monitoring_timeout = timeout;
        self
    }

    pub fn with_wait_windows(mut self, first: Duration, next: Duration) -> Self {
        self.first_wait = first;
        self.next_wait = next;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }
}

fn normalize_path(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    }
}

/// Check that an HTTP path can be routed.
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(RpcError::Config {
            message: format!("HTTP path must start with '/': {:?}", path),
        })
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| RpcError::Io {
        message: format!("Failed to read config {}: {}", path.display(), e),
        source: Some(e),
    })?;
    serde_json::from_str(&content).map_err(|e| RpcError::Config {
        message: format!("Invalid config {}: {}", path.display(), e),
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(path: &Path, raw: serde_json::Value) -> Result<T> {
    serde_json::from_value(raw).map_err(|e| RpcError::Config {
        message: format!("Invalid config {}: {}", path.display(), e),
    })
}

/// Durations are written as integer milliseconds in config files.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_interface_addr_parse() {
        let addr = InterfaceAddr::parse("127.0.0.2:9000").unwrap();
        assert_eq!(addr, InterfaceAddr::new("127.0.0.2", 9000));
        assert_eq!(addr.to_string(), "127.0.0.2:9000");

        let v6 = InterfaceAddr::parse("[::1]:8080").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:8080");

        assert!(InterfaceAddr::parse("no-port").is_err());
        assert!(InterfaceAddr::parse(":9000").is_err());
        assert!(InterfaceAddr::parse("host:99999").is_err());
    }

    #[test]
    fn test_tls_scheme() {
        assert_eq!(TlsConfig::default().scheme(), "http");
        let tls = TlsConfig::default().with_ca_file("/tmp/ca.crt");
        assert_eq!(tls.scheme(), "https");
        assert!(!tls.has_identity());
    }

    #[test]
    fn test_poll_delay_drives_bind_retry() {
        let config = ServerConfig::new().with_poll_delay(Duration::from_millis(100));
        assert_eq!(config.bind_retry.base_delay, Duration::from_millis(100));
        assert_eq!(config.bind_retry.max_attempts, None);
    }

    #[test]
    fn test_path_normalized() {
        assert_eq!(ClientConfig::new().with_path("rpc").path, "/rpc");
        assert_eq!(ServerConfig::new().with_path("/rpc").path, "/rpc");
    }

    #[test]
    fn test_server_config_from_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"interfaces":[{{"host":"127.0.0.1","port":9000}}],"poll_delay":250,
                "dispatch":{{"exempt_numeric_ids":false}}}}"#
        )
        .unwrap();

        let config = ServerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.interfaces, vec![InterfaceAddr::new("127.0.0.1", 9000)]);
        assert_eq!(config.poll_delay, Duration::from_millis(250));
        assert!(!config.dispatch.exempt_numeric_ids);
        assert_eq!(config.dispatch.clear_timeout, RpcDefaults::CLEAR_TIMEOUT);
        assert_eq!(config.path, RpcDefaults::RPC_PATH);
        assert_eq!(config.bind_retry.base_delay, config.poll_delay);
        assert_eq!(config.bind_retry.max_attempts, None);
    }

    #[test]
    fn test_explicit_bind_retry_kept_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"poll_delay":250,"bind_retry":{{"max_attempts":3,"base_delay":40,"max_delay":40}}}}"#
        )
        .unwrap();

        let config = ServerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.bind_retry.max_attempts, Some(3));
        assert_ne!(config.bind_retry.base_delay, config.poll_delay);
    }

    #[test]
    fn test_paths_from_json_are_normalized() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"path":"rpc"}}"#).unwrap();

        assert_eq!(ServerConfig::from_json_file(file.path()).unwrap().path, "/rpc");
        assert_eq!(ClientConfig::from_json_file(file.path()).unwrap().path, "/rpc");
        assert!(validate_path("/rpc").is_ok());
        assert!(matches!(validate_path("rpc"), Err(RpcError::Config { .. })));
    }

    #[test]
    fn test_client_config_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = ClientConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, RpcError::Config { .. }));
    }
}
