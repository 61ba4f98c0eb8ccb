// src/config.rs

//! Manages node configuration: loading, resolving dynamic values, and validation.

use crate::core::protocol::codec::DEFAULT_MAX_MESSAGE_SIZE;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::time::Duration;
use tracing::{info, warn};

/// Settings of the RPC machinery itself.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcConfig {
    /// Seconds between keepalive pings. 0 disables the pinger.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// How widely one key's tasks may spread across worker queues (0..=1).
    #[serde(default = "default_key_priority_factor")]
    pub key_priority_factor: f64,
    #[serde(default = "default_queue_push_timeout_ms")]
    pub queue_push_timeout_ms: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_remote_exec_timeout_ms")]
    pub remote_exec_timeout_ms: u64,
    /// Additional attempts to open a missing connection when a call asks for it.
    #[serde(default = "default_remote_exec_retries")]
    pub remote_exec_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 0 disables the read timeout.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 0 disables the write timeout.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

fn default_ping_interval_secs() -> u64 {
    30
}
fn default_key_priority_factor() -> f64 {
    0.5
}
fn default_queue_push_timeout_ms() -> u64 {
    100
}
fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}
fn default_remote_exec_timeout_ms() -> u64 {
    30_000
}
fn default_remote_exec_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_read_timeout_secs() -> u64 {
    120
}
fn default_write_timeout_secs() -> u64 {
    30
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            key_priority_factor: default_key_priority_factor(),
            queue_push_timeout_ms: default_queue_push_timeout_ms(),
            max_message_size: default_max_message_size(),
            remote_exec_timeout_ms: default_remote_exec_timeout_ms(),
            remote_exec_retries: default_remote_exec_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl RpcConfig {
    pub fn ping_interval(&self) -> Option<Duration> {
        non_zero_secs(self.ping_interval_secs)
    }

    pub fn queue_push_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_push_timeout_ms)
    }

    pub fn remote_exec_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_exec_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.write_timeout_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Sizing of the inbound task pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct RawPoolConfig {
    /// Resolved to the available parallelism when absent.
    #[serde(default)]
    workers: Option<usize>,
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(16)
}
fn default_queue_capacity() -> usize {
    256
}

/// A user accepted by the static authenticator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserEntry {
    #[serde(default)]
    pub domain: Option<String>,
    pub username: String,
    /// An argon2 PHC string.
    pub password_hash: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AuthConfig {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    /// HMAC key for signed tokens. Token logins are refused when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,
    #[serde(default)]
    pub allow_cross_domain_impersonation: bool,
    #[serde(default)]
    pub revoked_users: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// CA bundle used to verify client certificates. When set, clients are
    /// asked for a certificate but may still connect without one.
    #[serde(default)]
    pub client_ca_path: Option<String>,
}

fn default_cert_path() -> String {
    "peerlink.crt".to_string()
}
fn default_key_path() -> String {
    "peerlink.key".to_string()
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            client_ca_path: None,
        }
    }
}

/// An outbound connection established at start-up.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub key: String,
    pub addr: String,
    #[serde(default)]
    pub tls: bool,
    /// The name checked against the peer's certificate. Defaults to the host
    /// part of `addr`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl PeerConfig {
    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or_else(|| {
            self.addr
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or(&self.addr)
        })
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    /// If true, the Prometheus metrics endpoint is enabled.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9464
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// `max_message_size` accepts a byte count or a string with a unit.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum MessageSizeConfig {
    Bytes(usize),
    String(String),
}

#[derive(Deserialize, Debug, Clone, Default)]
struct RawRpcConfig {
    #[serde(default)]
    max_message_size: Option<MessageSizeConfig>,
    #[serde(flatten)]
    rest: RpcConfigWithoutSize,
}

/// `RpcConfig` minus the field that needs resolving.
#[derive(Deserialize, Debug, Clone)]
struct RpcConfigWithoutSize {
    #[serde(default = "default_ping_interval_secs")]
    ping_interval_secs: u64,
    #[serde(default = "default_key_priority_factor")]
    key_priority_factor: f64,
    #[serde(default = "default_queue_push_timeout_ms")]
    queue_push_timeout_ms: u64,
    #[serde(default = "default_remote_exec_timeout_ms")]
    remote_exec_timeout_ms: u64,
    #[serde(default = "default_remote_exec_retries")]
    remote_exec_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    retry_backoff_ms: u64,
    #[serde(default = "default_read_timeout_secs")]
    read_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    write_timeout_secs: u64,
}

impl Default for RpcConfigWithoutSize {
    fn default() -> Self {
        let d = RpcConfig::default();
        Self {
            ping_interval_secs: d.ping_interval_secs,
            key_priority_factor: d.key_priority_factor,
            queue_push_timeout_ms: d.queue_push_timeout_ms,
            remote_exec_timeout_ms: d.remote_exec_timeout_ms,
            remote_exec_retries: d.remote_exec_retries,
            retry_backoff_ms: d.retry_backoff_ms,
            read_timeout_secs: d.read_timeout_secs,
            write_timeout_secs: d.write_timeout_secs,
        }
    }
}

/// Helper struct for deserializing the raw TOML file before resolution.
#[derive(Deserialize, Debug)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    node_name: Option<String>,
    #[serde(default = "default_max_connections")]
    max_connections: usize,
    #[serde(default)]
    rpc: RawRpcConfig,
    #[serde(default)]
    pool: RawPoolConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    peers: Vec<PeerConfig>,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7420
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_connections() -> usize {
    1024
}
fn default_node_name() -> String {
    format!("peerlink-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Represents the final, validated, and resolved node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub node_name: String,
    pub max_connections: usize,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            node_name: default_node_name(),
            max_connections: default_max_connections(),
            rpc: RpcConfig::default(),
            pool: PoolConfig::default(),
            auth: AuthConfig::default(),
            tls: TlsConfig::default(),
            peers: Vec::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid config file '{path}'"))
    }

    /// Parses, resolves and validates a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).context("Failed to parse TOML")?;

        let max_message_size = match raw.rpc.max_message_size {
            None => default_max_message_size(),
            Some(size) => resolve_message_size(size)?,
        };
        let rest = raw.rpc.rest;
        let rpc = RpcConfig {
            ping_interval_secs: rest.ping_interval_secs,
            key_priority_factor: rest.key_priority_factor,
            queue_push_timeout_ms: rest.queue_push_timeout_ms,
            max_message_size,
            remote_exec_timeout_ms: rest.remote_exec_timeout_ms,
            remote_exec_retries: rest.remote_exec_retries,
            retry_backoff_ms: rest.retry_backoff_ms,
            read_timeout_secs: rest.read_timeout_secs,
            write_timeout_secs: rest.write_timeout_secs,
        };

        let pool = PoolConfig {
            workers: raw.pool.workers.unwrap_or_else(|| {
                let workers = default_workers();
                info!("Resolved pool.workers to {} from available parallelism.", workers);
                workers
            }),
            queue_capacity: raw.pool.queue_capacity,
        };

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            node_name: raw.node_name.unwrap_or_else(default_node_name),
            max_connections: raw.max_connections,
            rpc,
            pool,
            auth: raw.auth,
            tls: raw.tls,
            peers: raw.peers,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections cannot be 0"));
        }

        if !(0.0..=1.0).contains(&self.rpc.key_priority_factor) {
            return Err(anyhow!(
                "rpc.key_priority_factor must be between 0 and 1, got {}",
                self.rpc.key_priority_factor
            ));
        }
        if self.rpc.max_message_size == 0 {
            return Err(anyhow!("rpc.max_message_size cannot be 0"));
        }
        if self.rpc.max_message_size > u32::MAX as usize {
            return Err(anyhow!(
                "rpc.max_message_size cannot exceed {} bytes",
                u32::MAX
            ));
        }
        if self.rpc.remote_exec_timeout_ms == 0 {
            return Err(anyhow!("rpc.remote_exec_timeout_ms cannot be 0"));
        }
        if let (Some(read), Some(ping)) = (self.rpc.read_timeout(), self.rpc.ping_interval())
            && read <= ping
        {
            warn!(
                "rpc.read_timeout_secs ({}) is not above rpc.ping_interval_secs ({}); idle peers may be dropped.",
                self.rpc.read_timeout_secs, self.rpc.ping_interval_secs
            );
        }

        if self.pool.workers == 0 {
            return Err(anyhow!("pool.workers cannot be 0"));
        }
        if self.pool.queue_capacity == 0 {
            return Err(anyhow!("pool.queue_capacity cannot be 0"));
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
            if self
                .tls
                .client_ca_path
                .as_deref()
                .is_some_and(|path| path.trim().is_empty())
            {
                return Err(anyhow!("tls.client_ca_path cannot be empty when set"));
            }
        }

        let mut keys = HashSet::new();
        for peer in &self.peers {
            if peer.key.trim().is_empty() {
                return Err(anyhow!("peer key cannot be empty"));
            }
            if !keys.insert(peer.key.as_str()) {
                return Err(anyhow!("duplicate peer key '{}'", peer.key));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}

/// Resolves `max_message_size` into a byte count.
fn resolve_message_size(cfg: MessageSizeConfig) -> Result<usize> {
    match cfg {
        MessageSizeConfig::Bytes(b) => Ok(b),
        MessageSizeConfig::String(s) => {
            let s_lower = s.trim().to_lowercase();
            if let Some(val_str) = s_lower.strip_suffix("mb") {
                parse_size_string(&s, val_str, 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix('m') {
                parse_size_string(&s, val_str, 1024 * 1024)
            } else if let Some(val_str) = s_lower.strip_suffix("kb") {
                parse_size_string(&s, val_str, 1024)
            } else if let Some(val_str) = s_lower.strip_suffix('k') {
                parse_size_string(&s, val_str, 1024)
            } else {
                s_lower.parse().with_context(|| {
                    format!("Invalid max_message_size '{s}'. Use bytes or a unit (e.g. '16mb').")
                })
            }
        }
    }
}

/// Parses a string number with a unit (kb, mb) and applies a multiplier.
fn parse_size_string(original_str: &str, value_str: &str, multiplier: usize) -> Result<usize> {
    let value: usize = value_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid number in max_message_size: '{original_str}'"))?;
    Ok(value.saturating_mul(multiplier))
}
