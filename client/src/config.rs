//! Pool configuration.

use std::time::Duration;

use crate::hashing::HashAlg;

/// Configuration for a connection pool.
///
/// All sizing limits are per host. The pool copies this at `initialize`;
/// later edits to the original have no effect on a running pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server addresses ("host:port").
    pub servers: Vec<String>,
    /// Optional per-server weights. A server with weight W occupies W
    /// contiguous slots in the bucket vector. Missing or `None` means
    /// weight 1 for every server.
    pub weights: Option<Vec<u32>>,
    /// Connections opened per host at initialize (default: 3).
    pub init_conn: usize,
    /// Minimum idle connections per host, enforced by maintenance
    /// (default: 3).
    pub min_conn: usize,
    /// Maximum idle connections per host before maintenance trims
    /// (default: 10).
    pub max_conn: usize,
    /// Idle age after which a connection is eligible for trimming
    /// (default: 3 minutes).
    pub max_idle: Duration,
    /// Checkout age after which a busy connection is reclaimed
    /// (default: 5 minutes).
    pub max_busy: Duration,
    /// Maintenance wake interval; zero disables the worker (default: 5 s).
    pub maint_sleep: Duration,
    /// Socket read timeout; `None` blocks indefinitely (default: 10 s).
    pub read_timeout: Option<Duration>,
    /// Connect deadline; `None` blocks indefinitely (default: blocking).
    pub connect_timeout: Option<Duration>,
    /// Rehash onto other buckets when a host is unavailable (default: true).
    pub failover: bool,
    /// Leave Nagle's algorithm enabled on sockets (default: true).
    pub nagle: bool,
    /// Key-to-bucket hash algorithm (default: `Native`).
    pub hash_alg: HashAlg,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            servers: Vec::new(),
            weights: None,
            init_conn: 3,
            min_conn: 3,
            max_conn: 10,
            max_idle: Duration::from_secs(3 * 60),
            max_busy: Duration::from_secs(5 * 60),
            maint_sleep: Duration::from_secs(5),
            read_timeout: Some(Duration::from_secs(10)),
            connect_timeout: None,
            failover: true,
            nagle: true,
            hash_alg: HashAlg::default(),
        }
    }
}

impl PoolConfig {
    /// Convenience constructor for an unweighted server list.
    pub fn with_servers<S: Into<String>, I: IntoIterator<Item = S>>(servers: I) -> Self {
        PoolConfig {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}
