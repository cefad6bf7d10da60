//! Benchmark metrics.

use metriken::{metric, AtomicHistogram, Counter};

#[metric(name = "ops_completed", description = "Total operations completed")]
pub static COMPLETED_COUNT: Counter = Counter::new();

#[metric(name = "ops_get", description = "Total GET operations")]
pub static GET_COUNT: Counter = Counter::new();

#[metric(name = "ops_set", description = "Total SET operations")]
pub static SET_COUNT: Counter = Counter::new();

#[metric(name = "ops_delete", description = "Total DELETE operations")]
pub static DELETE_COUNT: Counter = Counter::new();

#[metric(name = "ops_errors", description = "Operations that returned an error")]
pub static ERROR_COUNT: Counter = Counter::new();

#[metric(name = "bench_hits", description = "GETs that found a value")]
pub static CACHE_HITS: Counter = Counter::new();

#[metric(name = "bench_misses", description = "GETs that missed")]
pub static CACHE_MISSES: Counter = Counter::new();

#[metric(
    name = "response_latency",
    description = "Response latency histogram (nanoseconds)"
)]
pub static RESPONSE_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

#[metric(
    name = "get_latency",
    description = "GET response latency histogram (nanoseconds)"
)]
pub static GET_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

#[metric(
    name = "set_latency",
    description = "SET response latency histogram (nanoseconds)"
)]
pub static SET_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

#[metric(
    name = "delete_latency",
    description = "DELETE response latency histogram (nanoseconds)"
)]
pub static DELETE_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);
