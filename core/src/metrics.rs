// Node metrics — lock-free counters and the health report
//
// Every counter is a relaxed atomic; readers get an eventually consistent
// snapshot, which is all the health endpoint needs.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Why a packet left the node without being forwarded or delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Tag mismatch or bad ephemeral key
    Integrity,
    /// Well-authenticated but unparseable content, or a wrong-sized frame
    Format,
    /// Layer fingerprint seen before
    Replay,
    /// Inbound queue full
    QueueFull,
    /// Exceeded max processing latency
    Expired,
    /// Next hop unreachable after retries
    Unreachable,
    /// VRF delay could not be computed
    Vrf,
}

impl DropReason {
    pub const ALL: [DropReason; 7] = [
        DropReason::Integrity,
        DropReason::Format,
        DropReason::Replay,
        DropReason::QueueFull,
        DropReason::Expired,
        DropReason::Unreachable,
        DropReason::Vrf,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Window during which a reported link degradation marks the node degraded.
const DEGRADED_WINDOW: Duration = Duration::from_secs(60);

/// Drop ratio above which the node reports itself degraded.
const DEGRADED_DROP_RATIO: f64 = 0.01;

#[derive(Debug, Default)]
pub struct NodeMetrics {
    received: AtomicU64,
    forwarded: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    active_connections: AtomicU64,
    latency_total_us: AtomicU64,
    latency_samples: AtomicU64,
    degraded_links: AtomicU64,
    last_degraded_unix: AtomicU64,
    drops_by_reason: [AtomicU64; 7],
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.drops_by_reason[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// A dequeued packet reached a decision after `latency`.
    pub fn record_processed(&self, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latency_total_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn record_link_degraded(&self) {
        self.degraded_links.fetch_add(1, Ordering::Relaxed);
        self.last_degraded_unix.store(unix_now(), Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dropped_for(&self, reason: DropReason) -> u64 {
        self.drops_by_reason[reason.index()].load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.latency_total_us.load(Ordering::Relaxed) as f64 / samples as f64 / 1000.0
    }

    fn is_degraded(&self) -> bool {
        let last = self.last_degraded_unix.load(Ordering::Relaxed);
        if last != 0 && unix_now().saturating_sub(last) < DEGRADED_WINDOW.as_secs() {
            return true;
        }
        let received = self.received();
        received >= 100 && self.dropped() as f64 / received as f64 > DEGRADED_DROP_RATIO
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: if self.is_degraded() {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            active_connections: self.active_connections(),
            packets_processed: self.processed(),
            packets_dropped: self.dropped(),
            avg_latency_ms: self.avg_latency_ms(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received(),
            forwarded: self.forwarded(),
            delivered: self.delivered(),
            dropped: self.dropped(),
            processed: self.processed(),
            active_connections: self.active_connections(),
            avg_latency_ms: self.avg_latency_ms(),
            degraded_links: self.degraded_links.load(Ordering::Relaxed),
            drops_by_reason: DropReason::ALL
                .iter()
                .map(|r| (*r, self.dropped_for(*r)))
                .filter(|(_, n)| *n > 0)
                .collect(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active_connections: u64,
    pub packets_processed: u64,
    pub packets_dropped: u64,
    pub avg_latency_ms: f64,
}

/// Body of `GET /metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub processed: u64,
    pub active_connections: u64,
    pub avg_latency_ms: f64,
    pub degraded_links: u64,
    pub drops_by_reason: Vec<(DropReason, u64)>,
}

/// Processed-packet rate over the last sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputReport {
    pub target_pps: u64,
    pub observed_pps: u64,
    /// Packets were waiting or rejected and the rate stayed under target
    pub below_target: bool,
}

/// Compares the pipeline's processed count against the configured target.
///
/// An idle node is never below target; only a backlog makes a low rate
/// meaningful.
pub struct ThroughputMonitor {
    target_pps: u64,
    last: Mutex<Option<(Instant, u64, u64)>>,
    report: Mutex<ThroughputReport>,
}

impl ThroughputMonitor {
    pub fn new(target_pps: u64) -> Self {
        Self {
            target_pps,
            last: Mutex::new(None),
            report: Mutex::new(ThroughputReport {
                target_pps,
                observed_pps: 0,
                below_target: false,
            }),
        }
    }

    /// Take a sample of the running `processed` and `rejected` totals.
    pub fn sample(&self, now: Instant, processed: u64, rejected: u64, queue_depth: usize) -> ThroughputReport {
        let mut last = self.last.lock();
        let report = match *last {
            Some((at, prev_processed, prev_rejected)) => {
                let secs = now.saturating_duration_since(at).as_secs_f64();
                let observed_pps = if secs > 0.0 {
                    (processed.saturating_sub(prev_processed) as f64 / secs) as u64
                } else {
                    0
                };
                let backlogged = queue_depth > 0 || rejected > prev_rejected;
                ThroughputReport {
                    target_pps: self.target_pps,
                    observed_pps,
                    below_target: backlogged && observed_pps < self.target_pps,
                }
            }
            None => self.report(),
        };
        *last = Some((now, processed, rejected));
        *self.report.lock() = report;
        report
    }

    pub fn report(&self) -> ThroughputReport {
        *self.report.lock()
    }
}
