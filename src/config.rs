//! Configuration
//!
//! `SentinelConfig` is built once at startup (TOML file, then `FERRUMHA_*`
//! environment overrides, then validation) and passed down as an `Arc`.
//! Nothing reads configuration from process-wide state after that.

use crate::address::NodeAddress;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "FERRUMHA_";

/// How a read connection picks among the replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaSelection {
    /// Rotate through the replica set
    #[default]
    RoundRobin,
    /// Pick the replica whose pool was used longest ago
    LeastRecentlyUsed,
}

impl std::str::FromStr for ReplicaSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" => Ok(ReplicaSelection::RoundRobin),
            "least_recently_used" | "lru" => Ok(ReplicaSelection::LeastRecentlyUsed),
            other => Err(format!("unknown replica selection '{}'", other)),
        }
    }
}

/// Monitor addresses, credentials, timeouts and pool limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Monitor (sentinel) addresses, "host:port"
    pub sentinels: Vec<String>,

    /// Logical name of the replication group
    pub master_name: String,

    /// Password for store nodes
    pub password: Option<String>,

    /// Password for monitors; falls back to `password`
    pub sentinel_password: Option<String>,

    /// Logical database selected on every store connection
    pub db: i64,

    pub socket_timeout_ms: u64,
    pub socket_connect_timeout_ms: u64,

    /// Resolution attempts before giving up
    pub max_retries: u32,
    pub retry_delay_ms: u64,

    /// Live connections per (address, role) pool
    pub max_connections: usize,

    pub replica_selection: ReplicaSelection,

    /// Allow writes against a view that lacks quorum
    pub best_effort_writes: bool,

    /// Diagnostics HTTP listen address
    pub web_addr: String,

    pub log_level: String,
    /// "pretty" or "json"
    pub log_format: String,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        SentinelConfig {
            sentinels: vec![
                "localhost:26379".to_string(),
                "localhost:26380".to_string(),
                "localhost:26381".to_string(),
            ],
            master_name: "redis-master".to_string(),
            password: None,
            sentinel_password: None,
            db: 0,
            socket_timeout_ms: 5000,
            socket_connect_timeout_ms: 5000,
            max_retries: 3,
            retry_delay_ms: 100,
            max_connections: 20,
            replica_selection: ReplicaSelection::RoundRobin,
            best_effort_writes: false,
            web_addr: "127.0.0.1:8080".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl SentinelConfig {
    /// Load from an optional TOML file, apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => SentinelConfig::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    /// Parse TOML text
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::config(format!("invalid TOML: {}", e)))
    }

    /// Override fields from `FERRUMHA_*` variables
    ///
    /// `lookup` is `std::env::var` in production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(list) = get("SENTINELS") {
            self.sentinels = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(name) = get("MASTER_NAME") {
            self.master_name = name;
        }
        if let Some(password) = get("PASSWORD") {
            self.password = Some(password);
        }
        if let Some(password) = get("SENTINEL_PASSWORD") {
            self.sentinel_password = Some(password);
        }
        if let Some(v) = get("DB") {
            self.db = parse_env("DB", &v)?;
        }
        if let Some(v) = get("SOCKET_TIMEOUT_MS") {
            self.socket_timeout_ms = parse_env("SOCKET_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("SOCKET_CONNECT_TIMEOUT_MS") {
            self.socket_connect_timeout_ms = parse_env("SOCKET_CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            self.max_retries = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RETRY_DELAY_MS") {
            self.retry_delay_ms = parse_env("RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("MAX_CONNECTIONS") {
            self.max_connections = parse_env("MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = get("REPLICA_SELECTION") {
            self.replica_selection = parse_env("REPLICA_SELECTION", &v)?;
        }
        if let Some(v) = get("BEST_EFFORT_WRITES") {
            self.best_effort_writes = parse_env("BEST_EFFORT_WRITES", &v)?;
        }
        if let Some(addr) = get("WEB_ADDR") {
            self.web_addr = addr;
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(format) = get("LOG_FORMAT") {
            self.log_format = format;
        }

        Ok(())
    }

    /// Check every field; the first problem found is reported
    pub fn validate(&self) -> Result<()> {
        self.monitor_endpoints()?;

        if self.master_name.trim().is_empty() {
            return Err(Error::config("master_name must not be empty"));
        }
        if self.socket_timeout_ms == 0 || self.socket_connect_timeout_ms == 0 {
            return Err(Error::config("socket timeouts must be greater than 0"));
        }
        if self.max_retries == 0 {
            return Err(Error::config("max_retries must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(Error::config("max_connections must be at least 1"));
        }
        if self.db < 0 {
            return Err(Error::config(format!("invalid db index {}", self.db)));
        }

        Ok(())
    }

    /// Parsed monitor addresses, in configured order
    pub fn monitor_endpoints(&self) -> Result<Vec<NodeAddress>> {
        if self.sentinels.is_empty() {
            return Err(Error::config("monitor list is empty"));
        }

        self.sentinels
            .iter()
            .map(|s| {
                s.parse::<NodeAddress>()
                    .map_err(|e| Error::config(format!("invalid monitor address: {}", e)))
            })
            .collect()
    }

    /// Password used against monitors
    pub fn monitor_password(&self) -> Option<&str> {
        self.sentinel_password
            .as_deref()
            .or(self.password.as_deref())
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn socket_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| Error::config(format!("invalid value '{}' for {}{}", value, ENV_PREFIX, name)))
}
