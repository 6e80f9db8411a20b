//! Byte accounting shared by all measurement handlers.
//!
//! # Responsibilities
//! - Count every payload byte served to and received from clients
//! - Stay lock-free: handlers on any connection may increment concurrently
//! - Derive per-second throughput for operator visibility

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How often the sampler wakes to derive throughput.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Monotonically increasing served/received byte counters.
///
/// Mutated only via atomic add; relaxed ordering is sufficient because the
/// counters carry totals, not synchronization between tasks.
#[derive(Debug, Default)]
pub struct ByteCounters {
    served: AtomicU64,
    received: AtomicU64,
}

impl ByteCounters {
    /// Create a fresh counter pair, both zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` bytes to the served total.
    pub fn add_served(&self, n: u64) {
        self.served.fetch_add(n, Ordering::Relaxed);
    }

    /// Add `n` bytes to the received total.
    pub fn add_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    /// Total bytes served so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Total bytes received so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Spawn the 1 Hz throughput sampler for one server instance.
///
/// The sampler only reads the atomics; it never blocks an increment. It logs
/// a line per interval in which traffic moved and stays silent otherwise.
pub fn spawn_throughput_sampler(
    label: String,
    counters: Arc<ByteCounters>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        // The first tick fires immediately; use it to establish the baseline.
        ticker.tick().await;
        let mut last_served = counters.served();
        let mut last_received = counters.received();

        loop {
            ticker.tick().await;
            let served = counters.served();
            let received = counters.received();
            let sent_delta = served - last_served;
            let received_delta = received - last_received;
            last_served = served;
            last_received = received;

            if sent_delta > 0 || received_delta > 0 {
                tracing::info!(
                    instance = %label,
                    sent_mbps = format_args!("{:.2}", mbps(sent_delta)),
                    received_mbps = format_args!("{:.2}", mbps(received_delta)),
                    "throughput"
                );
            }
        }
    })
}

/// Megabits per second for `delta` bytes moved over one sample interval.
fn mbps(delta: u64) -> f64 {
    let bps = delta as f64 / SAMPLE_INTERVAL.as_secs_f64();
    bps / (1024.0 * 1024.0) * 8.0
}
