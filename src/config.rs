use crate::rewrite::{DefaultBackend, DEFAULT_DOCKER_HOST_ALIAS};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Tenant store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Upstream forwarding configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Host whose root path redirects to the admin console
    pub admin_domain: Option<String>,

    /// Bearer token required by the admin API when set
    pub admin_token: Option<String>,

    /// Seconds to wait for in-flight connections on shutdown (default: 30)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_domain: None,
            admin_token: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite database file (default: ./tenants.db)
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Cache resolved hosts in memory (default: true)
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Lock wait for concurrent writers in milliseconds (default: 5000)
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            cache_enabled: true,
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Default backend for every tenant (default: http://localhost:3000)
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Upstream request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Open a fresh upstream connection per request
    #[serde(default)]
    pub disable_keep_alive: bool,

    /// Substitute for loopback backend domains (default: host.docker.internal)
    #[serde(default = "default_docker_host_alias")]
    pub docker_host_alias: String,

    /// When set, the resolved tenant id is sent upstream in this header
    pub tenant_id_header: Option<String>,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            disable_keep_alive: false,
            docker_host_alias: default_docker_host_alias(),
            tenant_id_header: None,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_database_path() -> String {
    "./tenants.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_backend_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_docker_host_alias() -> String {
    DEFAULT_DOCKER_HOST_ALIAS.to_string()
}

/// Parse a numeric override, keeping the current value when it does not parse
fn parse_override<T: std::str::FromStr>(key: &str, raw: &str, current: T) -> T {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = raw, "Ignoring unparseable environment override");
            current
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a lookup function. Empty values count as unset.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("HOST") {
            self.server.bind = v.trim().to_string();
        }
        if let Some(v) = get("PORT") {
            self.server.port = parse_override("PORT", &v, self.server.port);
        }
        if let Some(v) = get("ADMIN_DOMAIN") {
            self.server.admin_domain = non_empty(&v);
        }
        if let Some(v) = get("ADMIN_TOKEN") {
            self.server.admin_token = non_empty(&v);
        }
        if let Some(v) = get("DB_PATH") {
            self.database.path = v.trim().to_string();
        }
        if let Some(v) = get("CACHE_ENABLED") {
            self.database.cache_enabled = parse_bool(&v);
        }
        if let Some(v) = get("BACKEND_URL") {
            self.proxy.backend_url = v.trim().to_string();
        }
        if let Some(v) = get("PROXY_TIMEOUT") {
            self.proxy.request_timeout_secs =
                parse_override("PROXY_TIMEOUT", &v, self.proxy.request_timeout_secs);
        }
        if let Some(v) = get("PROXY_MAX_IDLE_CONNS") {
            self.proxy.pool_max_idle_per_host =
                parse_override("PROXY_MAX_IDLE_CONNS", &v, self.proxy.pool_max_idle_per_host);
        }
        if let Some(v) = get("PROXY_IDLE_CONN_TIMEOUT") {
            self.proxy.pool_idle_timeout_secs =
                parse_override("PROXY_IDLE_CONN_TIMEOUT", &v, self.proxy.pool_idle_timeout_secs);
        }
        if let Some(v) = get("PROXY_DISABLE_KEEPALIVE") {
            self.proxy.disable_keep_alive = parse_bool(&v);
        }
        if let Some(v) = get("DOCKER_HOST_ALIAS") {
            self.proxy.docker_host_alias = v.trim().to_string();
        }
        if let Some(v) = get("TENANT_ID_HEADER") {
            self.proxy.tenant_id_header = non_empty(&v);
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }

        if let Err(e) = DefaultBackend::parse(&self.proxy.backend_url) {
            errors.push(format!("proxy.backend_url: {}", e));
        }

        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy.request_timeout_secs must be non-zero".to_string());
        }

        if let Some(header) = &self.proxy.tenant_id_header {
            if hyper::header::HeaderName::from_bytes(header.as_bytes()).is_err() {
                errors.push(format!("proxy.tenant_id_header is not a valid header name: {}", header));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9090
bind = "127.0.0.1"
admin_domain = "admin.example.com"

[database]
path = "/var/lib/router/tenants.db"
cache_enabled = false

[proxy]
backend_url = "http://backend.internal:8000"
request_timeout_secs = 10
tenant_id_header = "X-Tenant-Id"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.address(), "127.0.0.1:9090");
        assert_eq!(config.server.admin_domain.as_deref(), Some("admin.example.com"));
        assert_eq!(config.database.path, "/var/lib/router/tenants.db");
        assert!(!config.database.cache_enabled);
        assert_eq!(config.database.busy_timeout(), Duration::from_millis(5000));
        assert_eq!(config.proxy.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.proxy.docker_host_alias, "host.docker.internal");
        assert_eq!(config.proxy.tenant_id_header.as_deref(), Some("X-Tenant-Id"));
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.database.path, "./tenants.db");
        assert!(config.database.cache_enabled);
        assert_eq!(config.proxy.backend_url, "http://localhost:3000");
        assert_eq!(config.proxy.request_timeout_secs, 30);
        assert_eq!(config.proxy.pool_max_idle_per_host, 10);
        assert_eq!(config.proxy.pool_idle_timeout(), Duration::from_secs(90));
        assert!(!config.proxy.disable_keep_alive);
        assert!(config.proxy.tenant_id_header.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "9000"),
            ("ADMIN_DOMAIN", "admin.local"),
            ("DB_PATH", "/tmp/t.db"),
            ("CACHE_ENABLED", "false"),
            ("BACKEND_URL", "http://api:4000"),
            ("PROXY_TIMEOUT", "5"),
            ("PROXY_MAX_IDLE_CONNS", "50"),
            ("PROXY_IDLE_CONN_TIMEOUT", "15"),
            ("PROXY_DISABLE_KEEPALIVE", "true"),
            ("DOCKER_HOST_ALIAS", "gateway"),
            ("TENANT_ID_HEADER", "X-Tenant"),
        ]));

        assert_eq!(config.server.address(), "127.0.0.1:9000");
        assert_eq!(config.server.admin_domain.as_deref(), Some("admin.local"));
        assert_eq!(config.database.path, "/tmp/t.db");
        assert!(!config.database.cache_enabled);
        assert_eq!(config.proxy.backend_url, "http://api:4000");
        assert_eq!(config.proxy.request_timeout_secs, 5);
        assert_eq!(config.proxy.pool_max_idle_per_host, 50);
        assert_eq!(config.proxy.pool_idle_timeout_secs, 15);
        assert!(config.proxy.disable_keep_alive);
        assert_eq!(config.proxy.docker_host_alias, "gateway");
        assert_eq!(config.proxy.tenant_id_header.as_deref(), Some("X-Tenant"));
    }

    #[test]
    fn test_unparseable_override_keeps_value() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[("PORT", "eighty"), ("PROXY_TIMEOUT", "-1")]));

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.proxy.request_timeout_secs, 30);
    }

    #[test]
    fn test_empty_override_is_unset() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[("BACKEND_URL", ""), ("DB_PATH", "  ")]));

        assert_eq!(config.proxy.backend_url, "http://localhost:3000");
        assert_eq!(config.database.path, "./tenants.db");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.server.port = 0;
        config.proxy.backend_url = "ftp://files.internal".to_string();
        config.proxy.tenant_id_header = Some("bad header".to_string());

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("server.port"));
        assert!(err.contains("proxy.backend_url"));
        assert!(err.contains("tenant_id_header"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.toml");
        std::fs::write(&path, "[proxy]\nbackend_url = \"http://127.0.0.1:5000\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.backend_url, "http://127.0.0.1:5000");
    }
}
