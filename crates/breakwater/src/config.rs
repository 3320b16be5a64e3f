//! The JSON configuration file. Process-level flags (ports, log levels)
//! live on the CLI; everything structured lives here. Config errors are
//! fatal at startup, before any request is accepted.

use anyhow::Context;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The shared webserver password (HTTP Basic).
    #[serde(default)]
    pub password: Option<String>,

    /// Source networks allowed to talk to the REST API.
    #[serde(default)]
    pub acl: Vec<IpNetwork>,

    #[serde(default)]
    pub stats_dbs: Vec<StatsDbConfig>,

    #[serde(default)]
    pub webhooks: Vec<WebHookConfig>,

    #[serde(default)]
    pub webhook_pool: WebHookPoolConfig,

    #[serde(default)]
    pub replication: Option<ReplicationConfig>,

    #[serde(default)]
    pub redis: Option<RedisConfig>,

    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsDbConfig {
    pub name: String,
    pub window_size: i64,
    pub num_windows: usize,
    #[serde(default = "default_num_shards")]
    pub num_shards: usize,
    /// Field name to type, e.g. `{"countLogins": "int"}`.
    pub fields: HashMap<String, String>,
    #[serde(default = "default_v4_prefix")]
    pub v4_prefix: u8,
    #[serde(default = "default_v6_prefix")]
    pub v6_prefix: u8,
    #[serde(default)]
    pub soft_max_entries: Option<usize>,
    #[serde(default)]
    pub expire_sleep_ms: Option<u64>,
    #[serde(default)]
    pub replicated: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebHookConfig {
    /// Event hooks subscribe to named events; custom hooks carry a name
    /// instead and are invoked explicitly.
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub config: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WebHookPoolConfig {
    pub num_threads: usize,
    pub max_conns: usize,
    pub max_queue_size: usize,
    pub timeout_secs: u64,
    pub verify_peer: bool,
    pub verify_host: bool,
    pub ca_cert_bundle: Option<std::path::PathBuf>,
}

impl Default for WebHookPoolConfig {
    fn default() -> Self {
        WebHookPoolConfig {
            num_threads: 5,
            max_conns: 10,
            max_queue_size: 50_000,
            timeout_secs: 2,
            verify_peer: true,
            verify_host: true,
            ca_cert_bundle: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    /// base64 of the 32-byte cluster key.
    pub key: String,
    /// Datagram listen address for inbound replication.
    pub listen: Option<SocketAddr>,
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub persist_replicated: bool,
    #[serde(default = "default_redis_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyConfig {
    /// Distinct passwords per source address before rejecting.
    pub max_diff_passwords: i64,
    /// Login attempts per account per retention horizon before tarpitting.
    pub max_login_attempts: i64,
    pub tarpit_secs: i32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            max_diff_passwords: 90,
            max_login_attempts: 100,
            tarpit_secs: 2,
        }
    }
}

fn default_num_shards() -> usize {
    4
}

fn default_v4_prefix() -> u8 {
    32
}

fn default_v6_prefix() -> u8 {
    128
}

fn default_true() -> bool {
    true
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_timeout() -> u64 {
    5
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Networks allowed when the config does not name any: loopback and
    /// RFC 1918 / link-local space.
    pub fn effective_acl(&self) -> Vec<IpNetwork> {
        if !self.acl.is_empty() {
            return self.acl.clone();
        }
        [
            "127.0.0.0/8",
            "10.0.0.0/8",
            "100.64.0.0/10",
            "169.254.0.0/16",
            "192.168.0.0/16",
            "172.16.0.0/12",
            "::1/128",
            "fe80::/10",
        ]
        .iter()
        .map(|s| s.parse().expect("static networks parse"))
        .collect()
    }

    /// The store set to create when the config defines none.
    pub fn default_stats_dbs() -> Vec<StatsDbConfig> {
        vec![StatsDbConfig {
            name: "default".to_string(),
            window_size: 600,
            num_windows: 6,
            num_shards: 4,
            fields: [
                ("countLogins", "int"),
                ("diffPasswords", "hll"),
                ("diffIPs", "hll"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            v4_prefix: 32,
            v6_prefix: 128,
            soft_max_entries: None,
            expire_sleep_ms: None,
            replicated: true,
        }]
    }
}
