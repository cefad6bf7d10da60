//! Connection pool and server selection.
//!
//! Pools are registered under a name and shared process-wide. A pool owns
//! every connection it creates; callers borrow one through a [`Checkout`]
//! guard and return it by dropping the guard. A background maintenance
//! worker keeps per-host pools inside their configured bounds and reclaims
//! connections from callers that leaked a checkout.

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectOptions, Connection};
use crate::error::{ClientError, ClientResult};
use crate::hashing;
use crate::metrics;

/// Divisor applied to `min_conn` to derive the creation batch cap.
const POOL_MULTIPLIER: usize = 4;

/// Seed for the dead-host backoff; doubled on every connect failure, so the
/// first failure yields a one second window.
const INITIAL_DEAD_BACKOFF: Duration = Duration::from_millis(500);

static REGISTRY: OnceLock<Mutex<HashMap<String, Pool>>> = OnceLock::new();

struct IdleConn {
    conn: Connection,
    last_used: Instant,
}

struct BusyConn {
    /// Duplicated socket handle so maintenance can shut a leaked checkout
    /// down without owning the connection.
    stream: Option<TcpStream>,
    checked_out: Instant,
}

#[derive(Default)]
struct PoolState {
    initialized: bool,
    config: PoolConfig,
    buckets: Vec<String>,
    avail: HashMap<String, Vec<IdleConn>>,
    busy: HashMap<String, HashMap<u64, BusyConn>>,
    dead_since: HashMap<String, Instant>,
    dead_duration: HashMap<String, Duration>,
    create_shift: HashMap<String, u32>,
}

struct MaintHandle {
    stop: crossbeam_channel::Sender<()>,
    thread: thread::JoinHandle<()>,
}

struct PoolInner {
    name: String,
    state: Mutex<PoolState>,
    maint: Mutex<Option<MaintHandle>>,
}

/// A named pool of connections to a set of memcached servers.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Name used by [`Pool::default_instance`].
    pub const DEFAULT_NAME: &'static str = "default";

    /// Return the pool registered under `name`, creating it if absent.
    ///
    /// The pool still requires [`initialize`](Pool::initialize) before use.
    pub fn instance(name: &str) -> Pool {
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        let mut pools = registry.lock();
        pools
            .entry(name.to_string())
            .or_insert_with(|| Pool {
                inner: Arc::new(PoolInner {
                    name: name.to_string(),
                    state: Mutex::new(PoolState::default()),
                    maint: Mutex::new(None),
                }),
            })
            .clone()
    }

    /// Return the pool registered under [`Pool::DEFAULT_NAME`].
    pub fn default_instance() -> Pool {
        Self::instance(Self::DEFAULT_NAME)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Initialize the pool: expand the bucket vector, eagerly open
    /// `init_conn` connections per host, and start the maintenance worker.
    ///
    /// Idempotent: a second call on an initialized pool logs and returns.
    pub fn initialize(&self, config: PoolConfig) -> ClientResult<()> {
        if config.servers.is_empty() {
            return Err(ClientError::Config("no servers configured".to_string()));
        }
        let buckets = expand_buckets(&config)?;

        {
            let mut state = self.inner.state.lock();
            if state.initialized {
                debug!(pool = %self.inner.name, "pool already initialized");
                return Ok(());
            }
            state.config = config;
            state.buckets = buckets;
            state.initialized = true;
        }

        // Eager connections, outside the lock. Individual failures are
        // tolerated; the first failure for a host puts it into backoff so
        // the rest of its batch is skipped rather than retried.
        let (hosts, init_conn) = {
            let state = self.inner.state.lock();
            (unique_hosts(&state.config.servers), state.config.init_conn)
        };
        for host in &hosts {
            for _ in 0..init_conn {
                match self.create_connection(host) {
                    Ok(conn) => self.park(conn),
                    Err(err) => {
                        warn!(pool = %self.inner.name, host = %host, %err,
                              "eager connection failed");
                        break;
                    }
                }
            }
        }

        let maint_sleep = self.inner.state.lock().config.maint_sleep;
        if !maint_sleep.is_zero() {
            self.start_maintenance(maint_sleep)?;
        }
        info!(pool = %self.inner.name, hosts = hosts.len(), "pool initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().initialized
    }

    /// Stop the maintenance worker, close every connection, and reset all
    /// state. Only the registry entry and the name survive; `initialize`
    /// afterwards yields a fresh pool.
    pub fn shutdown(&self) {
        let maint = self.inner.maint.lock().take();
        if let Some(handle) = maint {
            let _ = handle.stop.send(());
            let _ = handle.thread.join();
        }

        let (avail, busy, dead) = {
            let mut state = self.inner.state.lock();
            state.initialized = false;
            state.buckets.clear();
            state.dead_duration.clear();
            state.create_shift.clear();
            (
                std::mem::take(&mut state.avail),
                std::mem::take(&mut state.busy),
                std::mem::take(&mut state.dead_since),
            )
        };
        for _ in dead {
            metrics::HOSTS_DEAD.decrement();
        }
        for (_, idles) in avail {
            for mut idle in idles {
                idle.conn.true_close();
            }
        }
        for (_, conns) in busy {
            for (_, busy_conn) in conns {
                if let Some(stream) = busy_conn.stream {
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
        }
        info!(pool = %self.inner.name, "pool shut down");
    }

    /// Check out a connection for `key`, applying the configured hash and,
    /// when enabled, failover rehashing across buckets.
    ///
    /// `hash_code` overrides the hash computed from the key.
    pub fn checkout_for_key(&self, key: &str, hash_code: Option<i32>) -> ClientResult<Checkout> {
        let (buckets, failover, alg) = {
            let state = self.inner.state.lock();
            if !state.initialized {
                return Err(ClientError::Config("pool is not initialized".to_string()));
            }
            if state.buckets.is_empty() {
                return Err(ClientError::Config("no buckets".to_string()));
            }
            (
                state.buckets.clone(),
                state.config.failover,
                state.config.hash_alg,
            )
        };

        if buckets.len() == 1 {
            let conn = self.get_connection(&buckets[0])?;
            return Ok(self.checked_out(conn));
        }

        let mut hv = hash_code.unwrap_or_else(|| alg.hash(key));
        let mut last_err = None;
        for attempt in 0..buckets.len() {
            let idx = hashing::bucket_index(hv, buckets.len());
            match self.get_connection(&buckets[idx]) {
                Ok(conn) => return Ok(self.checked_out(conn)),
                Err(err) => {
                    if !failover {
                        return Err(err);
                    }
                    debug!(pool = %self.inner.name, key, bucket = %buckets[idx], %err,
                           "rehashing around unavailable bucket");
                    // Salt the key with the retry counter and fold the new
                    // hash into the running value.
                    hv = hv.wrapping_add(alg.hash(&format!("{}{}", attempt + 1, key)));
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| ClientError::Config("no reachable server for key".to_string())))
    }

    /// Check out a connection to a specific host.
    pub fn checkout_host(&self, host: &str) -> ClientResult<Checkout> {
        if !self.inner.state.lock().initialized {
            return Err(ClientError::Config("pool is not initialized".to_string()));
        }
        let conn = self.get_connection(host)?;
        Ok(self.checked_out(conn))
    }

    fn checked_out(&self, conn: Connection) -> Checkout {
        metrics::CHECKOUTS.increment();
        Checkout {
            pool: self.clone(),
            conn: Some(conn),
            valid: true,
        }
    }

    /// The configured server hosts, deduplicated in insertion order.
    pub fn servers(&self) -> Vec<String> {
        unique_hosts(&self.inner.state.lock().config.servers)
    }

    /// Snapshot of the bucket vector.
    pub fn buckets(&self) -> Vec<String> {
        self.inner.state.lock().buckets.clone()
    }

    /// Idle connections currently pooled for `host`.
    pub fn avail_count(&self, host: &str) -> usize {
        self.inner.state.lock().avail.get(host).map_or(0, Vec::len)
    }

    /// Connections currently checked out for `host`.
    pub fn busy_count(&self, host: &str) -> usize {
        self.inner.state.lock().busy.get(host).map_or(0, HashMap::len)
    }

    /// Open one connection to `host`, honoring the dead-host backoff.
    fn create_connection(&self, host: &str) -> ClientResult<Connection> {
        let options = {
            let state = self.inner.state.lock();
            if state.config.failover {
                if let (Some(since), Some(window)) = (
                    state.dead_since.get(host).copied(),
                    state.dead_duration.get(host).copied(),
                ) {
                    if since.elapsed() < window {
                        return Err(ClientError::DeadHost(host.to_string()));
                    }
                }
            }
            ConnectOptions {
                connect_timeout: state.config.connect_timeout,
                read_timeout: state.config.read_timeout,
                nagle: state.config.nagle,
            }
        };

        match Connection::connect(host, options) {
            Ok(conn) => {
                let mut state = self.inner.state.lock();
                if state.dead_since.remove(host).is_some() {
                    metrics::HOSTS_DEAD.decrement();
                    info!(pool = %self.inner.name, host, "host recovered");
                }
                state.dead_duration.remove(host);
                if !state.buckets.iter().any(|bucket| bucket == host) {
                    // Re-add at the sorted position so a binary search can
                    // locate the entry.
                    let idx = state
                        .buckets
                        .binary_search_by(|bucket| bucket.as_str().cmp(host))
                        .unwrap_or_else(|insert_at| insert_at);
                    state.buckets.insert(idx, host.to_string());
                }
                Ok(conn)
            }
            Err(err) => {
                let dropped = {
                    let mut state = self.inner.state.lock();
                    if state
                        .dead_since
                        .insert(host.to_string(), Instant::now())
                        .is_none()
                    {
                        metrics::HOSTS_DEAD.increment();
                    }
                    let window = state
                        .dead_duration
                        .get(host)
                        .copied()
                        .unwrap_or(INITIAL_DEAD_BACKOFF)
                        * 2;
                    state.dead_duration.insert(host.to_string(), window);
                    warn!(pool = %self.inner.name, host, %err,
                          backoff_ms = window.as_millis() as u64,
                          "connect failed, host in backoff");
                    state.avail.remove(host)
                };
                metrics::CONNECT_FAILURES.increment();
                if let Some(idles) = dropped {
                    for mut idle in idles {
                        idle.conn.true_close();
                    }
                }
                Err(err)
            }
        }
    }

    /// Take an idle connection for `host` or create a batch of new ones.
    fn get_connection(&self, host: &str) -> ClientResult<Connection> {
        let batch = {
            let mut state = self.inner.state.lock();
            if !state.initialized {
                return Err(ClientError::Config("pool is not initialized".to_string()));
            }
            if let Some(idles) = state.avail.get_mut(host) {
                while !idles.is_empty() {
                    let idle = idles.remove(0);
                    if idle.conn.is_connected() {
                        let conn = idle.conn;
                        register_busy(&mut state, &conn);
                        return Ok(conn);
                    }
                    // Entry went dead while idle; discard and keep scanning.
                }
            }
            let max_create = (state.config.min_conn / POOL_MULTIPLIER).max(1);
            let shift = state.create_shift.get(host).copied().unwrap_or(0);
            let create = (1usize << shift.min(31)).min(max_create);
            if create < max_create {
                state.create_shift.insert(host.to_string(), shift + 1);
            }
            create
        };

        let mut created = Vec::with_capacity(batch);
        let mut failure = None;
        for _ in 0..batch {
            match self.create_connection(host) {
                Ok(conn) => created.push(conn),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        match created.pop() {
            Some(conn) => {
                let mut state = self.inner.state.lock();
                let now = Instant::now();
                for extra in created {
                    state
                        .avail
                        .entry(host.to_string())
                        .or_default()
                        .push(IdleConn {
                            conn: extra,
                            last_used: now,
                        });
                }
                register_busy(&mut state, &conn);
                Ok(conn)
            }
            None => Err(failure
                .unwrap_or_else(|| ClientError::Config("empty creation batch".to_string()))),
        }
    }

    /// Return a connection to the pool.
    ///
    /// A connection whose busy entry was reclaimed by maintenance, or that
    /// is no longer connected, or that is returned with `add_to_avail`
    /// false, is closed instead of pooled.
    fn check_in(&self, mut conn: Connection, add_to_avail: bool) {
        let mut state = self.inner.state.lock();
        let was_busy = state
            .busy
            .get_mut(conn.host())
            .map_or(false, |conns| conns.remove(&conn.id()).is_some());
        if was_busy && add_to_avail && conn.is_connected() && state.initialized {
            let host = conn.host().to_string();
            state.avail.entry(host).or_default().push(IdleConn {
                conn,
                last_used: Instant::now(),
            });
        } else {
            drop(state);
            conn.true_close();
        }
    }

    /// Park a freshly created connection in the available set.
    fn park(&self, conn: Connection) {
        let mut state = self.inner.state.lock();
        let host = conn.host().to_string();
        state.avail.entry(host).or_default().push(IdleConn {
            conn,
            last_used: Instant::now(),
        });
    }

    fn start_maintenance(&self, interval: Duration) -> ClientResult<()> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let pool = self.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-maint", self.inner.name))
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    crossbeam_channel::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => pool.self_maint(),
                    }
                }
            })
            .map_err(ClientError::Io)?;
        *self.inner.maint.lock() = Some(MaintHandle {
            stop: stop_tx,
            thread: handle,
        });
        Ok(())
    }

    /// One maintenance pass: top up hosts below `min_conn`, trim hosts above
    /// `max_conn` by closing idle-expired entries, reset the creation shift,
    /// and reclaim checkouts held past `max_busy`.
    fn self_maint(&self) {
        let mut to_close: Vec<Connection> = Vec::new();
        let mut to_create: Vec<(String, usize)> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if !state.initialized {
                return;
            }
            let min_conn = state.config.min_conn;
            let max_conn = state.config.max_conn;
            let max_idle = state.config.max_idle;
            let max_busy = state.config.max_busy;
            let now = Instant::now();

            let hosts: Vec<String> = state.avail.keys().cloned().collect();
            for host in hosts {
                let idles = match state.avail.get_mut(&host) {
                    Some(idles) => idles,
                    None => continue,
                };
                if idles.len() < min_conn {
                    to_create.push((host.clone(), min_conn - idles.len()));
                } else if idles.len() > max_conn {
                    let diff = idles.len() - max_conn;
                    let mut need_to_close = if diff <= POOL_MULTIPLIER {
                        diff
                    } else {
                        diff / POOL_MULTIPLIER
                    };
                    // Victims are snapshotted here and closed after the
                    // lock is released.
                    let mut i = 0;
                    while i < idles.len() && need_to_close > 0 {
                        if now.duration_since(idles[i].last_used) > max_idle {
                            to_close.push(idles.swap_remove(i).conn);
                            need_to_close -= 1;
                        } else {
                            i += 1;
                        }
                    }
                }
                state.create_shift.insert(host, 0);
            }

            for (host, conns) in state.busy.iter_mut() {
                let expired: Vec<u64> = conns
                    .iter()
                    .filter(|(_, busy)| now.duration_since(busy.checked_out) > max_busy)
                    .map(|(&id, _)| id)
                    .collect();
                for id in expired {
                    if let Some(busy) = conns.remove(&id) {
                        warn!(pool = %self.inner.name, host = %host, id,
                              "reclaiming connection checked out too long");
                        metrics::CHECKOUTS_RECLAIMED.increment();
                        if let Some(stream) = busy.stream {
                            let _ = stream.shutdown(Shutdown::Both);
                        }
                    }
                }
            }
        }

        for mut conn in to_close {
            metrics::IDLE_TRIMMED.increment();
            conn.true_close();
        }
        for (host, missing) in to_create {
            for _ in 0..missing {
                match self.create_connection(&host) {
                    Ok(conn) => self.park(conn),
                    Err(err) => {
                        debug!(pool = %self.inner.name, host = %host, %err,
                               "maintenance top-up stopped");
                        break;
                    }
                }
            }
        }
    }
}

fn register_busy(state: &mut PoolState, conn: &Connection) {
    let stream = conn.stream().try_clone().ok();
    state
        .busy
        .entry(conn.host().to_string())
        .or_default()
        .insert(
            conn.id(),
            BusyConn {
                stream,
                checked_out: Instant::now(),
            },
        );
}

fn expand_buckets(config: &PoolConfig) -> ClientResult<Vec<String>> {
    let weights = match &config.weights {
        Some(weights) => {
            if weights.len() != config.servers.len() {
                return Err(ClientError::Config(format!(
                    "{} weights for {} servers",
                    weights.len(),
                    config.servers.len()
                )));
            }
            weights.clone()
        }
        None => vec![1; config.servers.len()],
    };
    let mut buckets = Vec::new();
    for (server, &weight) in config.servers.iter().zip(&weights) {
        if weight == 0 {
            return Err(ClientError::Config(format!(
                "server {server} has zero weight"
            )));
        }
        for _ in 0..weight {
            buckets.push(server.clone());
        }
    }
    Ok(buckets)
}

fn unique_hosts(servers: &[String]) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::with_capacity(servers.len());
    for server in servers {
        if !hosts.contains(server) {
            hosts.push(server.clone());
        }
    }
    hosts
}

/// A borrowed connection, returned to its pool on drop.
///
/// An operation that hits an io error calls [`invalidate`](Checkout::invalidate)
/// so the drop discards the connection instead of pooling it.
pub struct Checkout {
    pool: Pool,
    conn: Option<Connection>,
    valid: bool,
}

impl Checkout {
    /// Host this connection is attached to.
    pub fn host(&self) -> &str {
        match &self.conn {
            Some(conn) => conn.host(),
            None => "",
        }
    }

    /// Mark the connection as unusable; drop will close it.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("checkout already released")
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, self.valid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_expansion_matches_weights() {
        let mut config = PoolConfig::with_servers(["a:11211", "b:11211", "c:11211"]);
        config.weights = Some(vec![2, 1, 3]);
        let buckets = expand_buckets(&config).unwrap();
        assert_eq!(buckets.len(), 6);
        assert_eq!(
            buckets,
            vec!["a:11211", "a:11211", "b:11211", "c:11211", "c:11211", "c:11211"]
        );
    }

    #[test]
    fn bucket_expansion_defaults_to_weight_one() {
        let config = PoolConfig::with_servers(["a:11211", "b:11211"]);
        assert_eq!(expand_buckets(&config).unwrap().len(), 2);
    }

    #[test]
    fn bucket_expansion_rejects_mismatched_weights() {
        let mut config = PoolConfig::with_servers(["a:11211", "b:11211"]);
        config.weights = Some(vec![1]);
        assert!(expand_buckets(&config).is_err());
    }

    #[test]
    fn bucket_expansion_rejects_zero_weight() {
        let mut config = PoolConfig::with_servers(["a:11211"]);
        config.weights = Some(vec![0]);
        assert!(expand_buckets(&config).is_err());
    }

    #[test]
    fn registry_returns_same_pool() {
        let a = Pool::instance("registry-identity");
        let b = Pool::instance("registry-identity");
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn initialize_requires_servers() {
        let pool = Pool::instance("no-servers");
        let err = pool.initialize(PoolConfig::default()).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
        assert!(!pool.is_initialized());
    }

    #[test]
    fn checkout_requires_initialize() {
        let pool = Pool::instance("uninitialized");
        assert!(matches!(
            pool.checkout_for_key("key", None),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn unique_hosts_preserves_order() {
        let servers = vec!["b:1".to_string(), "a:1".to_string(), "b:1".to_string()];
        assert_eq!(unique_hosts(&servers), vec!["b:1", "a:1"]);
    }
}
