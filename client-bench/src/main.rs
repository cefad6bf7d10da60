//! Network benchmark. Drives the pooled memcache client against one or
//! more live servers and reports throughput and latency percentiles.

mod config;
mod metrics;
mod ratelimit;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use memcache_client::{Client, Pool};
use metriken::histogram::Histogram;
use metriken::AtomicHistogram;

use crate::config::Config;
use crate::ratelimit::RateLimiter;
use crate::worker::{Phase, SharedState};

const POOL_NAME: &str = "bench";

#[derive(Parser)]
#[command(name = "memcache-bench")]
#[command(about = "Network benchmark for the pooled memcache client")]
struct Args {
    /// Path to configuration file
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load config: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    print_config(&config);

    let pool = Pool::instance(POOL_NAME);
    pool.initialize(config.pool_config())?;

    let num_threads = config.general.threads;
    let warmup = config.general.warmup;
    let duration = config.general.duration;

    let shared = Arc::new(SharedState::new());
    let ratelimiter = if config.workload.rate_limit > 0 {
        Some(Arc::new(RateLimiter::new(config.workload.rate_limit)))
    } else {
        None
    };

    // Split the keyspace across workers for prefill.
    let prefill_ranges: Vec<Option<std::ops::Range<usize>>> = if config.workload.prefill {
        let key_count = config.workload.keyspace.count;
        let keys_per_worker = key_count / num_threads;
        let remainder = key_count % num_threads;
        (0..num_threads)
            .map(|id| {
                let start = if id < remainder {
                    id * (keys_per_worker + 1)
                } else {
                    remainder * (keys_per_worker + 1) + (id - remainder) * keys_per_worker
                };
                let count = if id < remainder {
                    keys_per_worker + 1
                } else {
                    keys_per_worker
                };
                Some(start..start + count)
            })
            .collect()
    } else {
        vec![None; num_threads]
    };

    if config.workload.prefill {
        eprintln!(
            "prefilling {} keys across {} threads...",
            config.workload.keyspace.count, num_threads
        );
        shared.set_phase(Phase::Prefill);
    } else {
        shared.set_phase(Phase::Warmup);
    }

    let config = Arc::new(config);
    let mut handles = Vec::with_capacity(num_threads);
    for id in 0..num_threads {
        let config = Arc::clone(&config);
        let shared = Arc::clone(&shared);
        let ratelimiter = ratelimiter.clone();
        let prefill_range = prefill_ranges[id].clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                let mut client = Client::with_pool_name(POOL_NAME);
                client.set_compress_enable(config.workload.compress_enable);
                client.set_compress_threshold(config.workload.compress_threshold);
                worker::run_worker(
                    id,
                    &config,
                    &client,
                    &shared,
                    ratelimiter.as_deref(),
                    prefill_range,
                );
            })?;
        handles.push(handle);
    }

    // Main thread: phase transitions and periodic reporting.
    let start = Instant::now();
    let report_interval = Duration::from_secs(1);
    let mut last_report = Instant::now();
    let mut last_completed = 0u64;
    let mut last_hits = 0u64;
    let mut last_misses = 0u64;
    let mut current_phase = if config.workload.prefill {
        Phase::Prefill
    } else {
        Phase::Warmup
    };
    let mut warmup_start = if config.workload.prefill {
        None
    } else {
        Some(start)
    };

    loop {
        thread::sleep(Duration::from_millis(100));

        if current_phase == Phase::Prefill {
            if shared.prefill_complete_count() >= num_threads {
                shared.set_phase(Phase::Warmup);
                current_phase = Phase::Warmup;
                warmup_start = Some(Instant::now());
                eprintln!("prefill complete, warming up for {warmup:?}...");
            }
            continue;
        }

        let elapsed = warmup_start.unwrap_or(start).elapsed();
        if elapsed >= warmup + duration {
            shared.set_phase(Phase::Stop);
            break;
        }

        if current_phase == Phase::Warmup && elapsed >= warmup {
            shared.set_phase(Phase::Running);
            current_phase = Phase::Running;
            eprintln!("running for {duration:?}...");
            print_header();
            last_report = Instant::now();
            last_completed = metrics::COMPLETED_COUNT.value();
            last_hits = metrics::CACHE_HITS.value();
            last_misses = metrics::CACHE_MISSES.value();
        }

        if current_phase != Phase::Running {
            continue;
        }

        if last_report.elapsed() >= report_interval {
            let completed = metrics::COMPLETED_COUNT.value();
            let hits = metrics::CACHE_HITS.value();
            let misses = metrics::CACHE_MISSES.value();

            let elapsed_secs = last_report.elapsed().as_secs_f64();
            let rate = (completed - last_completed) as f64 / elapsed_secs;
            last_completed = completed;

            let delta_hits = hits - last_hits;
            let delta_gets = delta_hits + (misses - last_misses);
            let hit_pct = if delta_gets > 0 {
                (delta_hits as f64 / delta_gets as f64) * 100.0
            } else {
                0.0
            };
            last_hits = hits;
            last_misses = misses;

            let p50 = percentile(&metrics::RESPONSE_LATENCY, 50.0) / 1000.0;
            let p99 = percentile(&metrics::RESPONSE_LATENCY, 99.0) / 1000.0;
            let p999 = percentile(&metrics::RESPONSE_LATENCY, 99.9) / 1000.0;

            println!("{rate:>12.0} {hit_pct:>7.1}% {p50:>10.1} {p99:>10.1} {p999:>10.1}");
            last_report = Instant::now();
        }
    }

    for handle in handles {
        let _ = handle.join();
    }

    print_summary(&config);
    pool.shutdown();
    Ok(())
}

fn print_config(config: &Config) {
    eprintln!("memcache-bench configuration:");
    eprintln!("  servers:    {}", config.pool.servers.join(", "));
    eprintln!("  threads:    {}", config.general.threads);
    eprintln!("  duration:   {:?}", config.general.duration);
    eprintln!("  warmup:     {:?}", config.general.warmup);
    eprintln!(
        "  commands:   get={} set={} delete={}",
        config.workload.commands.get, config.workload.commands.set, config.workload.commands.delete,
    );
    eprintln!(
        "  keyspace:   {} keys x {} bytes",
        config.workload.keyspace.count, config.workload.keyspace.length,
    );
    eprintln!("  values:     {} bytes", config.workload.values.length);
    eprintln!();
}

fn print_header() {
    println!(
        "{:>12} {:>8} {:>10} {:>10} {:>10}",
        "ops/sec", "hit%", "p50(us)", "p99(us)", "p999(us)",
    );
    println!("{}", "-".repeat(56));
}

fn print_summary(config: &Config) {
    let gets = metrics::GET_COUNT.value();
    let sets = metrics::SET_COUNT.value();
    let deletes = metrics::DELETE_COUNT.value();
    let completed = metrics::COMPLETED_COUNT.value();
    let errors = metrics::ERROR_COUNT.value();
    let hits = metrics::CACHE_HITS.value();
    let misses = metrics::CACHE_MISSES.value();

    let total_gets = hits + misses;
    let hit_pct = if total_gets > 0 {
        (hits as f64 / total_gets as f64) * 100.0
    } else {
        0.0
    };
    let elapsed = config.general.duration.as_secs_f64();
    let avg_rate = if elapsed > 0.0 {
        completed as f64 / elapsed
    } else {
        0.0
    };

    eprintln!();
    eprintln!("=== Final Summary ===");
    eprintln!("  total ops:    {completed}");
    eprintln!("  avg ops/sec:  {avg_rate:.0}");
    eprintln!("  gets:         {gets}");
    eprintln!("  sets:         {sets}");
    eprintln!("  deletes:      {deletes}");
    eprintln!("  errors:       {errors}");
    eprintln!("  hit rate:     {hit_pct:.1}%");
    eprintln!();

    print_latency_summary("GET", &metrics::GET_LATENCY);
    print_latency_summary("SET", &metrics::SET_LATENCY);
    if deletes > 0 {
        print_latency_summary("DELETE", &metrics::DELETE_LATENCY);
    }
    print_latency_summary("ALL", &metrics::RESPONSE_LATENCY);
}

fn print_latency_summary(label: &str, hist: &AtomicHistogram) {
    let p50 = percentile(hist, 50.0) / 1000.0;
    let p90 = percentile(hist, 90.0) / 1000.0;
    let p99 = percentile(hist, 99.0) / 1000.0;
    let p999 = percentile(hist, 99.9) / 1000.0;
    let max = percentile(hist, 100.0) / 1000.0;

    eprintln!(
        "  {label:<6} latency (us): p50={p50:.1}  p90={p90:.1}  p99={p99:.1}  p999={p999:.1}  max={max:.1}",
    );
}

fn percentile(hist: &AtomicHistogram, p: f64) -> f64 {
    match hist.load() {
        Some(snapshot) => percentile_from_histogram(&snapshot, p),
        None => 0.0,
    }
}

fn percentile_from_histogram(hist: &Histogram, p: f64) -> f64 {
    if let Ok(Some(results)) = hist.percentiles(&[p]) {
        if let Some((_pct, bucket)) = results.first() {
            return bucket.end() as f64;
        }
    }
    0.0
}
