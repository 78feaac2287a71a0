//! Request counters and latency statistics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of latency samples kept for percentile calculation.
pub const LATENCY_WINDOW: usize = 1000;

/// Metrics response payload (0xE3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub requests_total: u64,
    pub requests_active: u32,
    pub requests_allowed: u64,
    pub requests_blocked: u64,
    pub requests_errored: u64,
    pub average_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub uptime_seconds: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Collects counters and latency samples across sessions.
///
/// Counters are atomic so a single collector can be shared by every session
/// of a runner; the latency ring and custom map sit behind short-lived locks.
#[derive(Debug)]
pub struct MetricsCollector {
    start: Instant,
    requests_total: AtomicU64,
    requests_active: AtomicI64,
    requests_allowed: AtomicU64,
    requests_blocked: AtomicU64,
    requests_errored: AtomicU64,
    latencies: Mutex<VecDeque<f64>>,
    custom: Mutex<HashMap<String, serde_json::Value>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            requests_total: AtomicU64::new(0),
            requests_active: AtomicI64::new(0),
            requests_allowed: AtomicU64::new(0),
            requests_blocked: AtomicU64::new(0),
            requests_errored: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            custom: Mutex::new(HashMap::new()),
        }
    }

    /// Record a completed request and its processing latency.
    pub fn record_request(&self, allowed: bool, latency_ms: f64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.requests_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_blocked.fetch_add(1, Ordering::Relaxed);
        }

        let mut latencies = self.latencies.lock().expect("latency lock poisoned");
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(latency_ms);
    }

    /// Record a request whose callback failed.
    pub fn record_error(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_active(&self) {
        self.requests_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the active gauge, never below zero.
    pub fn decrement_active(&self) {
        let _ = self
            .requests_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some((v - 1).max(0))
            });
    }

    pub fn set_custom(&self, name: impl Into<String>, value: serde_json::Value) {
        self.custom
            .lock()
            .expect("custom metrics lock poisoned")
            .insert(name.into(), value);
    }

    /// Snapshot the current counters and latency percentiles.
    pub fn report(&self) -> MetricsReport {
        let latencies = self.latencies.lock().expect("latency lock poisoned");
        let (average, p50, p95, p99) = if latencies.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let sum: f64 = latencies.iter().sum();
            let mut sorted: Vec<f64> = latencies.iter().copied().collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).expect("latency is never NaN"));
            (
                sum / sorted.len() as f64,
                percentile(&sorted, 0.50),
                percentile(&sorted, 0.95),
                percentile(&sorted, 0.99),
            )
        };
        drop(latencies);

        MetricsReport {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_active: self.requests_active.load(Ordering::Relaxed).max(0) as u32,
            requests_allowed: self.requests_allowed.load(Ordering::Relaxed),
            requests_blocked: self.requests_blocked.load(Ordering::Relaxed),
            requests_errored: self.requests_errored.load(Ordering::Relaxed),
            average_latency_ms: average,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            uptime_seconds: self.start.elapsed().as_secs_f64(),
            custom: self
                .custom
                .lock()
                .expect("custom metrics lock poisoned")
                .clone(),
            timestamp: Utc::now(),
        }
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p) as usize;
    sorted[idx]
}
