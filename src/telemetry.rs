//! Request counters and per-service latency histograms. Cheap enough to
//! update on every call; snapshots feed the collaborator's metrics endpoint.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Upper bucket bounds in milliseconds; the last bucket is unbounded.
const BUCKET_BOUNDS_MS: [u64; 8] = [5, 10, 25, 50, 100, 250, 1000, 5000];

#[derive(Default)]
struct Histogram {
    buckets: [u64; BUCKET_BOUNDS_MS.len() + 1],
    count: u64,
    sum_micros: u64,
}

impl Histogram {
    fn observe(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_micros += duration.as_micros() as u64;
    }
}

/// Point-in-time view of one service's latency distribution.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub buckets: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub requests_degraded: u64,
    pub latencies: HashMap<String, LatencySnapshot>,
}

/// Process-wide retrieval telemetry.
#[derive(Default)]
pub struct Telemetry {
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    requests_degraded: AtomicU64,
    histograms: Mutex<HashMap<String, Histogram>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.requests_degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, service: &str, duration: Duration) {
        let mut histograms = self.histograms.lock().expect("telemetry lock poisoned");
        histograms.entry(service.to_string()).or_default().observe(duration);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let histograms = self.histograms.lock().expect("telemetry lock poisoned");
        let latencies = histograms
            .iter()
            .map(|(service, h)| {
                let mean_ms = if h.count == 0 {
                    0.0
                } else {
                    h.sum_micros as f64 / h.count as f64 / 1000.0
                };
                let mut buckets = Vec::with_capacity(h.buckets.len());
                for (i, count) in h.buckets.iter().enumerate() {
                    let label = match BUCKET_BOUNDS_MS.get(i) {
                        Some(bound) => format!("le_{bound}ms"),
                        None => "inf".to_string(),
                    };
                    buckets.push((label, *count));
                }
                (
                    service.clone(),
                    LatencySnapshot {
                        count: h.count,
                        mean_ms,
                        buckets,
                    },
                )
            })
            .collect();

        TelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_degraded: self.requests_degraded.load(Ordering::Relaxed),
            latencies,
        }
    }
}
