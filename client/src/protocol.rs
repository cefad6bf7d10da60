//! Protocol engine: maps operations onto memcached ASCII wire exchanges.
//!
//! Requests are strictly line-oriented; responses mix status lines with raw
//! byte payloads whose lengths are announced inline. Every io error destroys
//! the connection it occurred on via checkout invalidation, as does a
//! framing error inside a `VALUE` response, since that connection can no
//! longer be trusted to be on a line boundary.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, warn};

use crate::error::{ClientError, ClientResult};
use crate::metrics;
use crate::pool::{Checkout, Pool};

/// Storage command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreVerb {
    Set,
    Add,
    Replace,
}

impl StoreVerb {
    fn as_str(&self) -> &'static str {
        match self {
            StoreVerb::Set => "set",
            StoreVerb::Add => "add",
            StoreVerb::Replace => "replace",
        }
    }
}

/// Arithmetic command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithVerb {
    Incr,
    Decr,
}

impl ArithVerb {
    fn as_str(&self) -> &'static str {
        match self {
            ArithVerb::Incr => "incr",
            ArithVerb::Decr => "decr",
        }
    }
}

/// Memcached's cutoff between relative and absolute expiration times.
/// Relative times are capped below it so the ambiguity never arises.
const MAX_RELATIVE_EXPIRY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Resolve an expiration to the wire format: 0 for "never" (absent or at or
/// before the epoch), otherwise seconds from now capped at 30 days.
fn wire_exptime(expiry: Option<SystemTime>) -> u64 {
    let expiry = match expiry {
        Some(expiry) => expiry,
        None => return 0,
    };
    if expiry <= SystemTime::UNIX_EPOCH {
        return 0;
    }
    let delta = expiry
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    delta.min(MAX_RELATIVE_EXPIRY).as_secs()
}

/// One value parsed from a `VALUE` response.
struct WireValue {
    key: String,
    flags: u32,
    data: Vec<u8>,
}

/// Execute `set`/`add`/`replace`. Returns false on `NOT_STORED` or any other
/// non-fatal rejection.
pub(crate) fn store(
    pool: &Pool,
    verb: StoreVerb,
    key: &str,
    payload: &[u8],
    flags: u32,
    expiry: Option<SystemTime>,
) -> ClientResult<bool> {
    metrics::STORES.increment();
    let mut checkout = pool.checkout_for_key(key, None)?;
    let header = format!(
        "{} {} {} {} {}\r\n",
        verb.as_str(),
        key,
        flags,
        wire_exptime(expiry),
        payload.len()
    );

    let conn = checkout.conn_mut();
    conn.write(header.as_bytes());
    conn.write(payload);
    conn.write(b"\r\n");
    let line = match conn.flush().and_then(|_| conn.read_line()) {
        Ok(line) => line,
        Err(err) => {
            checkout.invalidate();
            return Err(err);
        }
    };

    match line.as_str() {
        "STORED" => Ok(true),
        "NOT_STORED" => {
            debug!(key, verb = verb.as_str(), "store rejected by server");
            Ok(false)
        }
        other => {
            error!(key, verb = verb.as_str(), response = other, "unexpected store response");
            Ok(false)
        }
    }
}

/// Fetch a single key. Returns the raw payload and flags, or `None` on miss.
pub(crate) fn fetch(pool: &Pool, key: &str) -> ClientResult<Option<(Vec<u8>, u32)>> {
    metrics::GETS.increment();
    let mut checkout = pool.checkout_for_key(key, None)?;
    let values = read_values(&mut checkout, &format!("get {key}\r\n"))?;
    let found = values
        .into_iter()
        .find(|value| value.key == key)
        .map(|value| (value.data, value.flags));
    if found.is_some() {
        metrics::HITS.increment();
    } else {
        metrics::MISSES.increment();
    }
    Ok(found)
}

/// Fetch several keys, grouping them by the host their hash resolves to and
/// issuing one `get k1 k2 …` per host. A failure on one host drops that
/// host's keys from the result without affecting the others.
pub(crate) fn fetch_multi(
    pool: &Pool,
    keys: &[&str],
) -> ClientResult<HashMap<String, (Vec<u8>, u32)>> {
    metrics::GETS.increment();
    let mut plans: HashMap<String, (Checkout, Vec<&str>)> = HashMap::new();
    for &key in keys {
        match pool.checkout_for_key(key, None) {
            Ok(checkout) => {
                let host = checkout.host().to_string();
                match plans.entry(host) {
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        // Duplicate checkout for a host already planned goes
                        // straight back to the pool.
                        entry.get_mut().1.push(key);
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert((checkout, vec![key]));
                    }
                }
            }
            Err(err) => {
                debug!(key, %err, "no server available for key");
            }
        }
    }

    let mut results = HashMap::new();
    for (host, (mut checkout, host_keys)) in plans {
        let mut command = String::with_capacity(4 + host_keys.iter().map(|k| k.len() + 1).sum::<usize>());
        command.push_str("get");
        for key in &host_keys {
            command.push(' ');
            command.push_str(key);
        }
        command.push_str("\r\n");

        match read_values(&mut checkout, &command) {
            Ok(values) => {
                for value in values {
                    metrics::HITS.increment();
                    results.insert(value.key, (value.data, value.flags));
                }
            }
            Err(err) => {
                warn!(host = %host, %err, "multi-get exchange failed, skipping host");
            }
        }
    }
    let misses = keys.len().saturating_sub(results.len());
    for _ in 0..misses {
        metrics::MISSES.increment();
    }
    Ok(results)
}

/// Send `command` and parse `VALUE …`/`END` framing. Invalidates the
/// checkout on io or framing errors.
fn read_values(checkout: &mut Checkout, command: &str) -> ClientResult<Vec<WireValue>> {
    let result = (|| {
        let conn = checkout.conn_mut();
        conn.write(command.as_bytes());
        conn.flush()?;

        let mut values = Vec::new();
        loop {
            let line = conn.read_line()?;
            if line == "END" {
                return Ok(values);
            }
            let header = line.strip_prefix("VALUE ").ok_or_else(|| {
                ClientError::Protocol(format!("unexpected response line: {line}"))
            })?;
            let mut parts = header.split_ascii_whitespace();
            let key = parts
                .next()
                .ok_or_else(|| ClientError::Protocol("VALUE line missing key".to_string()))?
                .to_string();
            let flags: u32 = parts
                .next()
                .and_then(|field| field.parse().ok())
                .ok_or_else(|| ClientError::Protocol("VALUE line missing flags".to_string()))?;
            let length: usize = parts
                .next()
                .and_then(|field| field.parse().ok())
                .ok_or_else(|| ClientError::Protocol("VALUE line missing length".to_string()))?;

            let mut data = vec![0u8; length];
            conn.read_exact(&mut data)?;
            conn.clear_eol()?;
            values.push(WireValue { key, flags, data });
        }
    })();
    if result.is_err() {
        checkout.invalidate();
    }
    result
}

/// Delete a key. Returns false on `NOT_FOUND`, which keeps the connection
/// alive.
pub(crate) fn delete(
    pool: &Pool,
    key: &str,
    expiry: Option<SystemTime>,
) -> ClientResult<bool> {
    metrics::DELETES.increment();
    let mut checkout = pool.checkout_for_key(key, None)?;
    let command = match expiry {
        Some(_) => format!("delete {} {}\r\n", key, wire_exptime(expiry)),
        None => format!("delete {key}\r\n"),
    };
    let line = exchange(&mut checkout, &command)?;
    match line.as_str() {
        "DELETED" => Ok(true),
        "NOT_FOUND" => Ok(false),
        other => {
            error!(key, response = other, "unexpected delete response");
            Ok(false)
        }
    }
}

/// Execute `incr`/`decr`. Returns the new value, or `None` when the key does
/// not exist.
pub(crate) fn incr_decr(
    pool: &Pool,
    verb: ArithVerb,
    key: &str,
    delta: u64,
) -> ClientResult<Option<u64>> {
    metrics::ARITHS.increment();
    let mut checkout = pool.checkout_for_key(key, None)?;
    let command = format!("{} {} {}\r\n", verb.as_str(), key, delta);
    let line = exchange(&mut checkout, &command)?;
    if line == "NOT_FOUND" {
        return Ok(None);
    }
    if !line.is_empty() && line.bytes().all(|byte| byte.is_ascii_digit()) {
        match line.parse::<u64>() {
            Ok(value) => return Ok(Some(value)),
            Err(_) => {
                error!(key, response = %line, "counter value out of range");
                return Ok(None);
            }
        }
    }
    error!(key, verb = verb.as_str(), response = %line, "unexpected arithmetic response");
    Ok(None)
}

/// Flush every target server (the whole server list when none are named).
/// Success only when every server acknowledged.
pub(crate) fn flush_all(pool: &Pool, servers: Option<&[String]>) -> ClientResult<bool> {
    let targets = match servers {
        Some(servers) => servers.to_vec(),
        None => pool.servers(),
    };
    let mut all_ok = true;
    for host in targets {
        match pool.checkout_host(&host) {
            Ok(mut checkout) => match exchange(&mut checkout, "flush_all\r\n") {
                Ok(line) if line == "OK" => {}
                Ok(line) => {
                    error!(host = %host, response = %line, "unexpected flush response");
                    all_ok = false;
                }
                Err(err) => {
                    warn!(host = %host, %err, "flush failed");
                    all_ok = false;
                }
            },
            Err(err) => {
                warn!(host = %host, %err, "flush skipped unreachable host");
                all_ok = false;
            }
        }
    }
    Ok(all_ok)
}

/// Collect `stats` from every target server into per-server maps.
pub(crate) fn stats(
    pool: &Pool,
    servers: Option<&[String]>,
) -> ClientResult<HashMap<String, HashMap<String, String>>> {
    let targets = match servers {
        Some(servers) => servers.to_vec(),
        None => pool.servers(),
    };
    let mut all = HashMap::new();
    for host in targets {
        let mut checkout = match pool.checkout_host(&host) {
            Ok(checkout) => checkout,
            Err(err) => {
                warn!(host = %host, %err, "stats skipped unreachable host");
                continue;
            }
        };
        let result = (|| {
            let conn = checkout.conn_mut();
            conn.write(b"stats\r\n");
            conn.flush()?;
            let mut entries = HashMap::new();
            loop {
                let line = conn.read_line()?;
                if line == "END" {
                    return Ok(entries);
                }
                match line.strip_prefix("STAT ") {
                    Some(rest) => {
                        let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
                        entries.insert(name.to_string(), value.to_string());
                    }
                    None => {
                        return Err(ClientError::Protocol(format!(
                            "unexpected stats line: {line}"
                        )));
                    }
                }
            }
        })();
        match result {
            Ok(entries) => {
                all.insert(host, entries);
            }
            Err(err) => {
                checkout.invalidate();
                warn!(host = %host, %err, "stats exchange failed");
            }
        }
    }
    Ok(all)
}

/// Send a one-line command and read the one-line response, invalidating the
/// checkout on io errors.
fn exchange(checkout: &mut Checkout, command: &str) -> ClientResult<String> {
    let conn = checkout.conn_mut();
    conn.write(command.as_bytes());
    match conn.flush().and_then(|_| conn.read_line()) {
        Ok(line) => Ok(line),
        Err(err) => {
            checkout.invalidate();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exptime_never() {
        assert_eq!(wire_exptime(None), 0);
        assert_eq!(wire_exptime(Some(SystemTime::UNIX_EPOCH)), 0);
        assert_eq!(
            wire_exptime(Some(SystemTime::UNIX_EPOCH - Duration::from_secs(1))),
            0
        );
    }

    #[test]
    fn exptime_relative_seconds() {
        let expiry = SystemTime::now() + Duration::from_secs(600);
        let wire = wire_exptime(Some(expiry));
        assert!((598..=600).contains(&wire), "got {wire}");
    }

    #[test]
    fn exptime_caps_at_thirty_days() {
        let expiry = SystemTime::now() + Duration::from_secs(365 * 24 * 60 * 60);
        assert_eq!(wire_exptime(Some(expiry)), MAX_RELATIVE_EXPIRY.as_secs());
    }

    #[test]
    fn verbs() {
        assert_eq!(StoreVerb::Set.as_str(), "set");
        assert_eq!(StoreVerb::Add.as_str(), "add");
        assert_eq!(StoreVerb::Replace.as_str(), "replace");
        assert_eq!(ArithVerb::Incr.as_str(), "incr");
        assert_eq!(ArithVerb::Decr.as_str(), "decr");
    }
}
