//! Worker statistics, their merged aggregate view, and the final test report.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TrafficConfig;

/// Seconds between two timestamps, clamped to zero.
fn span_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let micros = (end - start).num_microseconds().unwrap_or(i64::MAX);
    (micros.max(0) as f64) / 1_000_000.0
}

// ---------------------------------------------------------------------------
// WorkerStats
// ---------------------------------------------------------------------------

/// Final counters of one worker. Read-only once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: u32,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_failed: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Set when the worker outlived the join timeout and these are its
    /// last-known counters rather than a published result.
    #[serde(default)]
    pub abandoned: bool,
}

impl WorkerStats {
    pub fn duration_secs(&self) -> f64 {
        span_secs(self.started_at, self.ended_at)
    }

    pub fn pps(&self) -> f64 {
        let duration = self.duration_secs();
        if duration > 0.0 {
            self.packets_sent as f64 / duration
        } else {
            0.0
        }
    }

    pub fn mbps(&self) -> f64 {
        let duration = self.duration_secs();
        if duration > 0.0 {
            (self.bytes_sent * 8) as f64 / (duration * 1_000_000.0)
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerProgress
// ---------------------------------------------------------------------------

/// Live counters of a running worker, readable without locking.
#[derive(Debug)]
pub struct WorkerProgress {
    worker_id: u32,
    started_at: DateTime<Utc>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_failed: AtomicU64,
}

impl WorkerProgress {
    pub fn new(worker_id: u32) -> Self {
        Self {
            worker_id,
            started_at: Utc::now(),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_failed: AtomicU64::new(0),
        }
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn record_sent(&self, bytes: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns the failure count including this one.
    pub fn record_failure(&self) -> u64 {
        self.packets_failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Copy the counters out as a [`WorkerStats`] ending at `ended_at`.
    pub fn snapshot(&self, ended_at: DateTime<Utc>) -> WorkerStats {
        WorkerStats {
            worker_id: self.worker_id,
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_failed: self.packets_failed.load(Ordering::Relaxed),
            started_at: self.started_at,
            ended_at,
            abandoned: false,
        }
    }
}

// ---------------------------------------------------------------------------
// AggregateStats
// ---------------------------------------------------------------------------

/// Merged view over a set of [`WorkerStats`], recomputed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_failed: u64,
    pub workers: usize,
    pub abandoned_workers: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `max(end) - min(start)`: overlapping workers count once.
    pub duration_secs: f64,
    pub packets_per_sec: f64,
    pub megabits_per_sec: f64,
}

impl AggregateStats {
    pub fn merge(stats: &[WorkerStats]) -> Self {
        let mut agg = AggregateStats {
            workers: stats.len(),
            ..Default::default()
        };

        for s in stats {
            agg.packets_sent += s.packets_sent;
            agg.bytes_sent += s.bytes_sent;
            agg.packets_failed += s.packets_failed;
            if s.abandoned {
                agg.abandoned_workers += 1;
            }
        }

        agg.started_at = stats.iter().map(|s| s.started_at).min();
        agg.ended_at = stats.iter().map(|s| s.ended_at).max();

        if let (Some(start), Some(end)) = (agg.started_at, agg.ended_at) {
            agg.duration_secs = span_secs(start, end);
        }
        if agg.duration_secs > 0.0 {
            agg.packets_per_sec = agg.packets_sent as f64 / agg.duration_secs;
            agg.megabits_per_sec =
                (agg.bytes_sent * 8) as f64 / (agg.duration_secs * 1_000_000.0);
        }

        agg
    }
}

// ---------------------------------------------------------------------------
// TrafficReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_packets_sent: u64,
    pub total_bytes_sent: u64,
    pub total_packets_failed: u64,
    pub duration_secs: f64,
    pub target_pps: u64,
    pub actual_pps: f64,
    pub efficiency_percent: f64,
    pub throughput_mbps: f64,
    pub packet_size: u32,
    pub flows: u32,
    pub workers: u32,
    pub abandoned_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub average_pps_per_worker: f64,
    pub pps_standard_deviation: f64,
    pub worker_efficiency_percent: f64,
}

/// Everything a source node reports for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficReport {
    pub summary: ReportSummary,
    pub performance: PerformanceSummary,
    pub workers: Vec<WorkerStats>,
    pub configuration: TrafficConfig,
}

impl TrafficReport {
    pub fn build(config: &TrafficConfig, mut workers: Vec<WorkerStats>) -> Self {
        workers.sort_by_key(|w| w.worker_id);
        let agg = AggregateStats::merge(&workers);
        let target_pps = config.packet_rate;

        let pps_values: Vec<f64> = workers.iter().map(|w| w.pps()).filter(|p| *p > 0.0).collect();
        let (mean, std_dev) = mean_and_std_dev(&pps_values);

        let percent_of_target = |pps: f64| {
            if target_pps > 0 {
                pps / target_pps as f64 * 100.0
            } else {
                0.0
            }
        };

        TrafficReport {
            summary: ReportSummary {
                total_packets_sent: agg.packets_sent,
                total_bytes_sent: agg.bytes_sent,
                total_packets_failed: agg.packets_failed,
                duration_secs: agg.duration_secs,
                target_pps,
                actual_pps: agg.packets_per_sec,
                efficiency_percent: percent_of_target(agg.packets_per_sec),
                throughput_mbps: agg.megabits_per_sec,
                packet_size: config.packet_size,
                flows: config.flows,
                workers: config.workers,
                abandoned_workers: agg.abandoned_workers,
            },
            performance: PerformanceSummary {
                average_pps_per_worker: mean,
                pps_standard_deviation: std_dev,
                worker_efficiency_percent: percent_of_target(mean * f64::from(config.workers)),
            },
            workers,
            configuration: config.clone(),
        }
    }

    /// One-line human-readable summary.
    pub fn summary_line(&self) -> String {
        let s = &self.summary;
        let speed = if s.throughput_mbps >= 1000.0 {
            format!("{:.2} Gbps", s.throughput_mbps / 1000.0)
        } else {
            format!("{:.1} Mbps", s.throughput_mbps)
        };

        let mut line = format!(
            "{} packets in {:.2}s: {:.0} pps of {} target ({:.1}%), {} ({} worker{})",
            s.total_packets_sent,
            s.duration_secs,
            s.actual_pps,
            s.target_pps,
            s.efficiency_percent,
            speed,
            s.workers,
            if s.workers == 1 { "" } else { "s" },
        );
        if s.total_packets_failed > 0 {
            line.push_str(&format!(", {} failed", s.total_packets_failed));
        }
        if s.abandoned_workers > 0 {
            line.push_str(&format!(", {} abandoned", s.abandoned_workers));
        }
        line
    }
}

/// Mean and sample standard deviation.
fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1.0);
    (mean, variance.sqrt())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
