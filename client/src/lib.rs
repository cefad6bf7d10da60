//! Pooled client for the memcached ASCII protocol.
//!
//! Keys are routed to servers by a weighted bucket vector and one of three
//! hash algorithms, with failover rehashing around unavailable hosts.
//! Connections are pooled per host, with dead-host backoff and a background
//! maintenance worker that keeps pools sized and reclaims leaked checkouts.
//!
//! # Example
//!
//! ```no_run
//! use memcache_client::{Client, Pool, PoolConfig, Value};
//!
//! # fn example() -> Result<(), memcache_client::ClientError> {
//! let pool = Pool::default_instance();
//! pool.initialize(PoolConfig::with_servers(["127.0.0.1:11211"]))?;
//!
//! let client = Client::new();
//! client.set("greeting", &Value::from("hello"))?;
//! assert_eq!(client.get("greeting")?, Some(Value::from("hello")));
//!
//! client.store_counter("visits", 10)?;
//! assert_eq!(client.incr("visits", 5)?, Some(15));
//!
//! pool.shutdown();
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod connection;
mod error;
pub mod hashing;
pub mod metrics;
mod pool;
mod protocol;

pub use codec::{Codec, Value, DEFAULT_COMPRESS_THRESHOLD, F_COMPRESSED, F_SERIALIZED};
pub use config::PoolConfig;
pub use error::{ClientError, ClientResult};
pub use hashing::HashAlg;
pub use pool::{Checkout, Pool};

use std::collections::HashMap;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use protocol::{ArithVerb, StoreVerb};

/// Client façade over a named pool.
///
/// Stateless beyond the pool handle and the codec settings; safe to share
/// across threads. All operations borrow a pooled connection for exactly one
/// wire exchange.
pub struct Client {
    pool: Pool,
    primitive_as_string: bool,
    compress_enable: bool,
    compress_threshold: usize,
}

impl Client {
    /// Client over the default pool.
    pub fn new() -> Self {
        Self::with_pool_name(Pool::DEFAULT_NAME)
    }

    /// Client over the pool registered under `name`.
    pub fn with_pool_name(name: &str) -> Self {
        Client {
            pool: Pool::instance(name),
            primitive_as_string: false,
            compress_enable: true,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        }
    }

    /// The pool this client routes through.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn primitive_as_string(&self) -> bool {
        self.primitive_as_string
    }

    /// Store native values as their textual representation instead of the
    /// tagged binary layout.
    pub fn set_primitive_as_string(&mut self, enabled: bool) {
        self.primitive_as_string = enabled;
    }

    pub fn compress_enable(&self) -> bool {
        self.compress_enable
    }

    /// Enable gzip compression for payloads at or above the threshold.
    /// Reads always decompress regardless of this setting.
    pub fn set_compress_enable(&mut self, enabled: bool) {
        self.compress_enable = enabled;
    }

    pub fn compress_threshold(&self) -> usize {
        self.compress_threshold
    }

    pub fn set_compress_threshold(&mut self, threshold: usize) {
        self.compress_threshold = threshold;
    }

    fn codec(&self) -> Codec {
        Codec {
            compress_enable: self.compress_enable,
            compress_threshold: self.compress_threshold,
        }
    }

    // ── Storage ─────────────────────────────────────────────────────────

    /// Store a value unconditionally. False means the server rejected it.
    pub fn set(&self, key: &str, value: &Value) -> ClientResult<bool> {
        self.store(StoreVerb::Set, key, value, None)
    }

    /// Store a value unconditionally with an expiration time.
    pub fn set_expires(&self, key: &str, value: &Value, expiry: SystemTime) -> ClientResult<bool> {
        self.store(StoreVerb::Set, key, value, Some(expiry))
    }

    /// Store only when the key does not exist yet.
    pub fn add(&self, key: &str, value: &Value) -> ClientResult<bool> {
        self.store(StoreVerb::Add, key, value, None)
    }

    /// Store only when the key does not exist yet, with an expiration time.
    pub fn add_expires(&self, key: &str, value: &Value, expiry: SystemTime) -> ClientResult<bool> {
        self.store(StoreVerb::Add, key, value, Some(expiry))
    }

    /// Store only when the key already exists.
    pub fn replace(&self, key: &str, value: &Value) -> ClientResult<bool> {
        self.store(StoreVerb::Replace, key, value, None)
    }

    /// Store only when the key already exists, with an expiration time.
    pub fn replace_expires(
        &self,
        key: &str,
        value: &Value,
        expiry: SystemTime,
    ) -> ClientResult<bool> {
        self.store(StoreVerb::Replace, key, value, Some(expiry))
    }

    fn store(
        &self,
        verb: StoreVerb,
        key: &str,
        value: &Value,
        expiry: Option<SystemTime>,
    ) -> ClientResult<bool> {
        let (payload, flags) = match self.codec().encode(value, self.primitive_as_string) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(key, %err, "failed to encode value");
                return Ok(false);
            }
        };
        protocol::store(&self.pool, verb, key, &payload, flags, expiry)
    }

    /// Store an arbitrary serializable value through the opaque path.
    pub fn store_serialized<T: Serialize>(&self, key: &str, value: &T) -> ClientResult<bool> {
        self.store_serialized_inner(key, value, None)
    }

    /// Store an arbitrary serializable value with an expiration time.
    pub fn store_serialized_expires<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expiry: SystemTime,
    ) -> ClientResult<bool> {
        self.store_serialized_inner(key, value, Some(expiry))
    }

    fn store_serialized_inner<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expiry: Option<SystemTime>,
    ) -> ClientResult<bool> {
        let (payload, flags) = match self.codec().encode_serialized(value) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(key, %err, "failed to serialize value");
                return Ok(false);
            }
        };
        protocol::store(&self.pool, StoreVerb::Set, key, &payload, flags, expiry)
    }

    // ── Retrieval ───────────────────────────────────────────────────────

    /// Fetch a native value. `None` on miss.
    pub fn get(&self, key: &str) -> ClientResult<Option<Value>> {
        match protocol::fetch(&self.pool, key)? {
            Some((data, flags)) => self
                .codec()
                .decode(data, flags, self.primitive_as_string)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Fetch a value through the string path, bypassing tagged decoding.
    pub fn get_str(&self, key: &str) -> ClientResult<Option<String>> {
        match protocol::fetch(&self.pool, key)? {
            Some((data, flags)) => match self.codec().decode(data, flags, true)? {
                Value::Str(text) => Ok(Some(text)),
                other => Ok(Some(other.to_string())),
            },
            None => Ok(None),
        }
    }

    /// Fetch a value stored through the opaque serialization path.
    pub fn fetch_serialized<T: DeserializeOwned>(&self, key: &str) -> ClientResult<Option<T>> {
        match protocol::fetch(&self.pool, key)? {
            Some((data, flags)) => self.codec().decode_serialized(data, flags).map(Some),
            None => Ok(None),
        }
    }

    /// Fetch several keys in one exchange per server. Missing keys are
    /// absent from the result.
    pub fn get_multi(&self, keys: &[&str]) -> ClientResult<HashMap<String, Value>> {
        let raw = protocol::fetch_multi(&self.pool, keys)?;
        let codec = self.codec();
        let mut values = HashMap::with_capacity(raw.len());
        for (key, (data, flags)) in raw {
            match codec.decode(data, flags, self.primitive_as_string) {
                Ok(value) => {
                    values.insert(key, value);
                }
                Err(err) => {
                    error!(key, %err, "failed to decode value, dropping key");
                }
            }
        }
        Ok(values)
    }

    // ── Deletion and arithmetic ─────────────────────────────────────────

    /// Delete a key. False when the key was not present.
    pub fn delete(&self, key: &str) -> ClientResult<bool> {
        protocol::delete(&self.pool, key, None)
    }

    /// Delete a key with a blocking window during which add/replace fail.
    pub fn delete_expires(&self, key: &str, expiry: SystemTime) -> ClientResult<bool> {
        protocol::delete(&self.pool, key, Some(expiry))
    }

    /// Increment a counter. `None` when the key does not exist.
    pub fn incr(&self, key: &str, delta: u64) -> ClientResult<Option<u64>> {
        protocol::incr_decr(&self.pool, ArithVerb::Incr, key, delta)
    }

    /// Decrement a counter, clamping at zero server-side. `None` when the
    /// key does not exist.
    pub fn decr(&self, key: &str, delta: u64) -> ClientResult<Option<u64>> {
        protocol::incr_decr(&self.pool, ArithVerb::Decr, key, delta)
    }

    // ── Counters ────────────────────────────────────────────────────────

    /// Store a counter value. Counters always travel as ASCII text so the
    /// server-side `incr`/`decr` arithmetic can operate on them.
    pub fn store_counter(&self, key: &str, value: u64) -> ClientResult<bool> {
        let payload = value.to_string().into_bytes();
        protocol::store(&self.pool, StoreVerb::Set, key, &payload, 0, None)
    }

    /// Fetch a counter value. `None` on miss or when the stored value does
    /// not parse as a counter.
    pub fn get_counter(&self, key: &str) -> ClientResult<Option<u64>> {
        match protocol::fetch(&self.pool, key)? {
            Some((data, flags)) => {
                let text = match self.codec().decode(data, flags, true)? {
                    Value::Str(text) => text,
                    other => other.to_string(),
                };
                Ok(text.trim().parse().ok())
            }
            None => Ok(None),
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Flush every target server (the whole server list when `None`).
    /// True only when every server acknowledged.
    pub fn flush_all(&self, servers: Option<&[String]>) -> ClientResult<bool> {
        protocol::flush_all(&self.pool, servers)
    }

    /// Collect server statistics, one map per reachable server.
    pub fn stats(
        &self,
        servers: Option<&[String]>,
    ) -> ClientResult<HashMap<String, HashMap<String, String>>> {
        protocol::stats(&self.pool, servers)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
