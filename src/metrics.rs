//! # Metrics Sink
//!
//! Counter sink injected into the broker at construction; its lifetime
//! equals the broker's. The core only increments named counters — exporting
//! them (Prometheus or otherwise) is an external adapter's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Counter names used by the broker and protocols.
pub mod counter {
    pub const TX_ERRORS: &str = "tx_errors";
    pub const RX_CRYPTO_ERRORS: &str = "rx_crypto_errors";
    pub const PROTOCOL_ERRORS: &str = "protocol_errors";
    pub const HEALTH_FAILURES: &str = "health_failures";
    pub const MESSAGES_SENT: &str = "messages_sent";
    pub const MESSAGES_RECEIVED: &str = "messages_received";
}

/// Destination for the core's counters.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, counter: &'static str);
}

/// Sink that drops everything. The default when no adapter is wired in.
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn incr(&self, _counter: &'static str) {}
}

/// In-memory counting sink, used by tests and the CLI stats surface.
#[derive(Default)]
pub struct CounterMetrics {
    counters: Mutex<HashMap<&'static str, Arc<AtomicU64>>>,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: &'static str) -> u64 {
        self.counters
            .lock()
            .expect("metrics lock poisoned")
            .get(counter)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counters
            .lock()
            .expect("metrics lock poisoned")
            .iter()
            .map(|(name, value)| (*name, value.load(Ordering::Relaxed)))
            .collect()
    }
}

impl MetricsSink for CounterMetrics {
    fn incr(&self, counter: &'static str) {
        let cell = {
            let mut counters = self.counters.lock().expect("metrics lock poisoned");
            counters.entry(counter).or_default().clone()
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }
}
