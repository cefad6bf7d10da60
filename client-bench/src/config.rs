//! Configuration for the network benchmark.

use std::time::Duration;

use memcache_client::{HashAlg, PoolConfig};
use serde::Deserialize;

/// Top-level configuration.
#[derive(Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub pool: BenchPoolConfig,
    pub workload: WorkloadConfig,
}

/// General benchmark settings.
#[derive(Deserialize)]
pub struct GeneralConfig {
    /// How long to run the measurement phase.
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    /// How long to warm up before recording metrics.
    #[serde(deserialize_with = "deserialize_duration")]
    pub warmup: Duration,
    /// Number of worker threads.
    pub threads: usize,
}

/// Pool and server settings.
#[derive(Deserialize)]
pub struct BenchPoolConfig {
    /// Server addresses ("host:port").
    pub servers: Vec<String>,
    /// Optional per-server weights.
    #[serde(default)]
    pub weights: Option<Vec<u32>>,
    #[serde(default = "default_init_conn")]
    pub init_conn: usize,
    #[serde(default = "default_min_conn")]
    pub min_conn: usize,
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
    /// Maintenance wake interval; "0s" disables the worker.
    #[serde(default = "default_maint_sleep", deserialize_with = "deserialize_duration")]
    pub maint_sleep: Duration,
    #[serde(default = "default_read_timeout", deserialize_with = "deserialize_duration")]
    pub read_timeout: Duration,
    #[serde(default = "default_connect_timeout", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    #[serde(default = "default_true")]
    pub failover: bool,
    /// Leave Nagle's algorithm enabled. Benchmarks usually want it off.
    #[serde(default)]
    pub nagle: bool,
    #[serde(default)]
    pub hash_alg: HashAlgConfig,
}

/// Hash algorithm selection.
#[derive(Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgConfig {
    #[default]
    Native,
    #[serde(alias = "old-compat")]
    OldCompat,
    #[serde(alias = "new-compat")]
    NewCompat,
}

impl From<HashAlgConfig> for HashAlg {
    fn from(value: HashAlgConfig) -> Self {
        match value {
            HashAlgConfig::Native => HashAlg::Native,
            HashAlgConfig::OldCompat => HashAlg::OldCompat,
            HashAlgConfig::NewCompat => HashAlg::NewCompat,
        }
    }
}

/// Workload configuration.
#[derive(Deserialize)]
pub struct WorkloadConfig {
    /// Rate limit in ops/sec across all workers. 0 = unlimited.
    #[serde(default)]
    pub rate_limit: u64,
    /// Whether to write each key once before measuring.
    #[serde(default)]
    pub prefill: bool,
    /// Enable gzip compression on stores.
    #[serde(default)]
    pub compress_enable: bool,
    /// Compression threshold in bytes.
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold: usize,
    /// Keyspace parameters.
    pub keyspace: KeyspaceConfig,
    /// Command mix (must sum to 100).
    pub commands: CommandsConfig,
    /// Value parameters.
    pub values: ValuesConfig,
}

/// Keyspace configuration.
#[derive(Deserialize)]
pub struct KeyspaceConfig {
    /// Key length in bytes.
    pub length: usize,
    /// Number of distinct keys.
    pub count: usize,
}

/// Command mix (percentages, must sum to 100).
#[derive(Deserialize)]
pub struct CommandsConfig {
    pub get: u8,
    pub set: u8,
    pub delete: u8,
}

/// Value configuration.
#[derive(Deserialize)]
pub struct ValuesConfig {
    /// Value length in bytes.
    pub length: usize,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        let total = config.workload.commands.get as u16
            + config.workload.commands.set as u16
            + config.workload.commands.delete as u16;
        if total != 100 {
            return Err(format!(
                "command mix must sum to 100 (got {}): get={} set={} delete={}",
                total,
                config.workload.commands.get,
                config.workload.commands.set,
                config.workload.commands.delete,
            )
            .into());
        }
        if config.pool.servers.is_empty() {
            return Err("at least one server must be configured".into());
        }

        Ok(config)
    }

    /// Build the pool configuration for the client under test.
    pub fn pool_config(&self) -> PoolConfig {
        let mut pool = PoolConfig::with_servers(self.pool.servers.clone());
        pool.weights = self.pool.weights.clone();
        pool.init_conn = self.pool.init_conn;
        pool.min_conn = self.pool.min_conn;
        pool.max_conn = self.pool.max_conn;
        pool.maint_sleep = self.pool.maint_sleep;
        pool.read_timeout = Some(self.pool.read_timeout);
        pool.connect_timeout = Some(self.pool.connect_timeout);
        pool.failover = self.pool.failover;
        pool.nagle = self.pool.nagle;
        pool.hash_alg = self.pool.hash_alg.into();
        pool
    }
}

fn default_init_conn() -> usize {
    3
}

fn default_min_conn() -> usize {
    3
}

fn default_max_conn() -> usize {
    10
}

fn default_maint_sleep() -> Duration {
    Duration::from_secs(5)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_compress_threshold() -> usize {
    memcache_client::DEFAULT_COMPRESS_THRESHOLD
}

fn default_true() -> bool {
    true
}

/// Deserialize a duration from a human-readable string (e.g., "60s", "5m").
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [general]
            duration = "30s"
            warmup = "5s"
            threads = 4

            [pool]
            servers = ["127.0.0.1:11211"]
            maint_sleep = "1s"
            hash_alg = "new-compat"

            [workload]
            rate_limit = 1000
            prefill = true
            keyspace = { length = 16, count = 1000 }
            commands = { get = 80, set = 15, delete = 5 }
            values = { length = 128 }
            "#,
        )
        .unwrap();
        assert_eq!(config.general.threads, 4);
        assert_eq!(config.pool.init_conn, 3);
        assert!(matches!(config.pool.hash_alg, HashAlgConfig::NewCompat));
        assert_eq!(config.workload.keyspace.count, 1000);
    }
}
