//! Worker thread for the network benchmark.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use memcache_client::{Client, Value};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::config::Config;
use crate::metrics;
use crate::ratelimit::RateLimiter;

/// Test phase, controlled by the main thread and read by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Write each key exactly once.
    Prefill = 0,
    /// Run the workload without recording metrics.
    Warmup = 1,
    /// Main measurement phase.
    Running = 2,
    /// Workers should exit.
    Stop = 3,
}

impl Phase {
    #[inline]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Prefill,
            1 => Phase::Warmup,
            2 => Phase::Running,
            _ => Phase::Stop,
        }
    }
}

/// State shared between the main thread and workers.
pub struct SharedState {
    phase: AtomicU8,
    prefill_complete: AtomicUsize,
}

impl SharedState {
    pub fn new() -> Self {
        SharedState {
            phase: AtomicU8::new(Phase::Prefill as u8),
            prefill_complete: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn mark_prefill_complete(&self) {
        self.prefill_complete.fetch_add(1, Ordering::Release);
    }

    pub fn prefill_complete_count(&self) -> usize {
        self.prefill_complete.load(Ordering::Acquire)
    }
}

/// Run one worker thread against the client.
pub fn run_worker(
    id: usize,
    config: &Config,
    client: &Client,
    shared: &SharedState,
    ratelimiter: Option<&RateLimiter>,
    prefill_range: Option<std::ops::Range<usize>>,
) {
    let key_len = config.workload.keyspace.length;
    let key_count = config.workload.keyspace.count;
    let value_len = config.workload.values.length;
    let get_threshold = config.workload.commands.get;
    let set_threshold = get_threshold + config.workload.commands.set;

    let mut key_buf = vec![0u8; key_len];
    let mut value_buf = vec![0u8; value_len];

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42 + id as u64);
    fill_ascii(&mut rng, &mut value_buf);

    // Prefill phase
    if let Some(range) = prefill_range {
        for key_id in range {
            write_key(&mut key_buf, key_id);
            let _ = client.set(key_str(&key_buf), &value(&value_buf));
        }
    }
    shared.mark_prefill_complete();

    loop {
        let phase = shared.phase();
        match phase {
            Phase::Prefill => {
                std::hint::spin_loop();
                continue;
            }
            Phase::Stop => break,
            Phase::Warmup | Phase::Running => {}
        }

        if let Some(limiter) = ratelimiter {
            if !limiter.try_acquire() {
                std::hint::spin_loop();
                continue;
            }
        }

        let key_id = rng.random_range(0..key_count);
        write_key(&mut key_buf, key_id);
        let key = key_str(&key_buf);

        let roll: u8 = rng.random_range(0..100);
        let recording = phase == Phase::Running;

        if roll < get_threshold {
            let start = Instant::now();
            let result = client.get(key);
            let elapsed_ns = start.elapsed().as_nanos() as u64;

            if recording {
                metrics::GET_COUNT.increment();
                metrics::COMPLETED_COUNT.increment();
                match result {
                    Ok(Some(_)) => { metrics::CACHE_HITS.increment(); }
                    Ok(None) => { metrics::CACHE_MISSES.increment(); }
                    Err(_) => { metrics::ERROR_COUNT.increment(); }
                }
                let _ = metrics::RESPONSE_LATENCY.increment(elapsed_ns);
                let _ = metrics::GET_LATENCY.increment(elapsed_ns);
            }
        } else if roll < set_threshold {
            fill_ascii(&mut rng, &mut value_buf);
            let start = Instant::now();
            let result = client.set(key, &value(&value_buf));
            let elapsed_ns = start.elapsed().as_nanos() as u64;

            if recording {
                metrics::SET_COUNT.increment();
                metrics::COMPLETED_COUNT.increment();
                if !matches!(result, Ok(true)) {
                    metrics::ERROR_COUNT.increment();
                }
                let _ = metrics::RESPONSE_LATENCY.increment(elapsed_ns);
                let _ = metrics::SET_LATENCY.increment(elapsed_ns);
            }
        } else {
            let start = Instant::now();
            let result = client.delete(key);
            let elapsed_ns = start.elapsed().as_nanos() as u64;

            if recording {
                metrics::DELETE_COUNT.increment();
                metrics::COMPLETED_COUNT.increment();
                if result.is_err() {
                    metrics::ERROR_COUNT.increment();
                }
                let _ = metrics::RESPONSE_LATENCY.increment(elapsed_ns);
                let _ = metrics::DELETE_LATENCY.increment(elapsed_ns);
            }
        }
    }
}

/// Write a numeric key ID into the buffer as hex.
fn write_key(buf: &mut [u8], id: usize) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut n = id;
    for byte in buf.iter_mut().rev() {
        *byte = HEX[n & 0xf];
        n >>= 4;
    }
}

fn key_str(buf: &[u8]) -> &str {
    // Buffer only ever holds hex digits.
    std::str::from_utf8(buf).unwrap_or("0")
}

fn value(buf: &[u8]) -> Value {
    Value::Str(String::from_utf8_lossy(buf).into_owned())
}

/// Fill the buffer with random lowercase ASCII.
fn fill_ascii<R: Rng>(rng: &mut R, buf: &mut [u8]) {
    rng.fill_bytes(buf);
    for byte in buf.iter_mut() {
        *byte = b'a' + (*byte % 26);
    }
}
