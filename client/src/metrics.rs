//! Client metrics.

use metriken::{metric, Counter, Gauge};

// Connection lifecycle
#[metric(
    name = "connections_opened",
    description = "Total TCP connections opened"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "connections_closed",
    description = "Total TCP connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(name = "connect_failures", description = "Total failed connects")]
pub static CONNECT_FAILURES: Counter = Counter::new();

#[metric(
    name = "hosts_dead",
    description = "Hosts currently in dead-host backoff"
)]
pub static HOSTS_DEAD: Gauge = Gauge::new();

// Pool activity
#[metric(name = "checkouts", description = "Total connection checkouts")]
pub static CHECKOUTS: Counter = Counter::new();

#[metric(
    name = "checkouts_reclaimed",
    description = "Busy connections reclaimed by maintenance"
)]
pub static CHECKOUTS_RECLAIMED: Counter = Counter::new();

#[metric(
    name = "idle_trimmed",
    description = "Idle connections closed by maintenance"
)]
pub static IDLE_TRIMMED: Counter = Counter::new();

// Requests
#[metric(name = "requests_get", description = "Total get operations")]
pub static GETS: Counter = Counter::new();

#[metric(name = "requests_store", description = "Total set/add/replace operations")]
pub static STORES: Counter = Counter::new();

#[metric(name = "requests_delete", description = "Total delete operations")]
pub static DELETES: Counter = Counter::new();

#[metric(name = "requests_arith", description = "Total incr/decr operations")]
pub static ARITHS: Counter = Counter::new();

#[metric(name = "cache_hits", description = "Keys found by get")]
pub static HITS: Counter = Counter::new();

#[metric(name = "cache_misses", description = "Keys absent from get")]
pub static MISSES: Counter = Counter::new();
