//! Multi-worker traffic engine.
//!
//! Splits a [`TrafficConfig`] across `workers` paced tasks, tracks the run
//! state, and merges finished worker statistics. The run state and the
//! results collection are the only state shared between the caller and the
//! workers; both live behind one short-held lock, and readers copy out.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ConfigurationError;

use super::stats::{AggregateStats, TrafficReport, WorkerProgress, WorkerStats};
use super::worker::{bind_sender, PacedWorker};
use super::{payload, TrafficConfig, TrafficError, WorkerPlan};

/// Default bound on waiting for workers after a stop request.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// `Idle -> Running -> {Completed | Failed | Stopped} -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Stopped
        )
    }
}

// ---------------------------------------------------------------------------
// TrafficEngine
// ---------------------------------------------------------------------------

struct EngineInner {
    state: RunState,
    results: Vec<WorkerStats>,
    live: Vec<Arc<WorkerProgress>>,
    cancel: Option<CancellationToken>,
}

struct JoinOutcome {
    crashed: usize,
    stopped: bool,
}

pub struct TrafficEngine {
    test_id: String,
    config: TrafficConfig,
    parent: CancellationToken,
    join_timeout: Duration,
    inner: Mutex<EngineInner>,
}

impl TrafficEngine {
    /// Create an idle engine for a validated configuration.
    ///
    /// Every run uses a child of `cancel`, so cancelling the parent stops
    /// any run in progress.
    pub fn new(config: TrafficConfig, cancel: CancellationToken) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            test_id: Uuid::new_v4().to_string(),
            config,
            parent: cancel,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            inner: Mutex::new(EngineInner {
                state: RunState::Idle,
                results: Vec::new(),
                live: Vec::new(),
                cancel: None,
            }),
        })
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn config(&self) -> &TrafficConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.inner.lock().state
    }

    /// Run the test to completion or until [`stop`](Self::stop) is called.
    ///
    /// Returns `false` without touching the engine if it is not idle, and
    /// `false` after moving to `Failed` if workers could not be launched.
    pub async fn start(&self) -> bool {
        self.begin() && self.run().await
    }

    /// Claim the engine for a run: `Idle -> Running`.
    ///
    /// From here on [`stop`](Self::stop) takes effect even if [`run`](Self::run)
    /// has not been polled yet. Returns `false` if the engine is not idle.
    pub fn begin(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != RunState::Idle {
            warn!(
                test_id = self.test_id.as_str(),
                state = ?inner.state,
                "traffic generation already running or not reset"
            );
            return false;
        }
        inner.state = RunState::Running;
        inner.results.clear();
        inner.live.clear();
        inner.cancel = Some(self.parent.child_token());
        true
    }

    /// Drive a run claimed by [`begin`](Self::begin) to a terminal state.
    pub async fn run(&self) -> bool {
        let cancel = {
            let inner = self.inner.lock();
            match (&inner.state, &inner.cancel) {
                (RunState::Running, Some(cancel)) => cancel.clone(),
                _ => {
                    warn!(test_id = self.test_id.as_str(), state = ?inner.state, "run without begin");
                    return false;
                }
            }
        };

        if cancel.is_cancelled() {
            info!(test_id = self.test_id.as_str(), "stopped before workers were launched");
            self.finish(RunState::Stopped);
            return true;
        }

        let plan = self.config.plan();
        info!(
            test_id = self.test_id.as_str(),
            target = %self.config.target,
            packet_rate = self.config.packet_rate,
            duration_sec = self.config.duration_secs,
            packet_size = self.config.packet_size,
            flows = self.config.flows,
            workers = self.config.workers,
            pps_per_worker = plan.pps_per_worker,
            packets_per_worker = plan.packets_per_worker,
            "starting traffic generation"
        );

        let workers = match self.prepare_workers(&plan, &cancel).await {
            Ok(workers) => workers,
            Err(e) => {
                error!(test_id = self.test_id.as_str(), error = %e, "failed to launch workers");
                self.finish(RunState::Failed);
                return false;
            }
        };

        self.inner.lock().live = workers.iter().map(|w| w.progress()).collect();

        let mut set = JoinSet::new();
        for worker in workers {
            set.spawn(worker.run());
        }

        let outcome = self.collect(&mut set, &cancel).await;

        let final_state = if outcome.crashed > 0 && outcome.crashed == self.config.workers as usize {
            RunState::Failed
        } else if outcome.stopped {
            RunState::Stopped
        } else {
            RunState::Completed
        };
        self.finish(final_state);

        let stats = self.statistics();
        info!(
            test_id = self.test_id.as_str(),
            state = ?final_state,
            packets_sent = stats.packets_sent,
            packets_failed = stats.packets_failed,
            abandoned_workers = stats.abandoned_workers,
            duration_sec = stats.duration_secs,
            pps = stats.packets_per_sec as u64,
            "traffic generation finished"
        );

        final_state != RunState::Failed
    }

    /// Signal every worker to stop. No-op unless running.
    ///
    /// Does not interrupt an in-flight send; workers exit at their next
    /// pacing check. A run that has begun but not yet launched its workers
    /// ends `Stopped` without sending.
    pub fn stop(&self) {
        let inner = self.inner.lock();
        if inner.state != RunState::Running {
            return;
        }
        if let Some(cancel) = &inner.cancel {
            info!(test_id = self.test_id.as_str(), "stopping traffic generation");
            cancel.cancel();
        }
    }

    /// Merge of the published worker statistics. Safe mid-run.
    pub fn statistics(&self) -> AggregateStats {
        let results = self.inner.lock().results.clone();
        AggregateStats::merge(&results)
    }

    /// Published statistics plus live counters of workers still running.
    pub fn live_statistics(&self) -> AggregateStats {
        let (mut results, live) = {
            let inner = self.inner.lock();
            (inner.results.clone(), inner.live.clone())
        };
        let finished: HashSet<u32> = results.iter().map(|s| s.worker_id).collect();
        let now = Utc::now();
        results.extend(
            live.iter()
                .filter(|p| !finished.contains(&p.worker_id()))
                .map(|p| p.snapshot(now)),
        );
        AggregateStats::merge(&results)
    }

    /// Full report over the published statistics.
    pub fn report(&self) -> TrafficReport {
        let results = self.inner.lock().results.clone();
        TrafficReport::build(&self.config, results)
    }

    /// Clear results of a finished run and return to `Idle`.
    ///
    /// Returns the cleared statistics; empty if the engine is running.
    pub fn reset(&self) -> Vec<WorkerStats> {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            return Vec::new();
        }
        inner.state = RunState::Idle;
        inner.live.clear();
        std::mem::take(&mut inner.results)
    }

    async fn prepare_workers(
        &self,
        plan: &WorkerPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<PacedWorker>, TrafficError> {
        let targets: Arc<[SocketAddr]> = self.config.flow_targets().into();
        let first = *targets.first().ok_or(TrafficError::NoFlowTargets(0))?;
        let payload = payload::generate(self.config.packet_size);

        let mut workers = Vec::with_capacity(self.config.workers as usize);
        for id in 0..self.config.workers {
            let socket = bind_sender(&first)
                .await
                .map_err(|source| TrafficError::SocketBind { worker: id, source })?;
            workers.push(PacedWorker::new(
                id,
                plan.pps_per_worker,
                plan.packets_per_worker,
                payload.clone(),
                targets.clone(),
                socket,
                cancel.clone(),
            )?);
        }
        Ok(workers)
    }

    /// Publish worker results until all finish or `cancel` fires, then
    /// bound the wait for the rest by the join timeout. Workers still
    /// running after that are aborted and recorded as abandoned.
    async fn collect(
        &self,
        set: &mut JoinSet<WorkerStats>,
        cancel: &CancellationToken,
    ) -> JoinOutcome {
        let mut crashed = 0usize;
        loop {
            tokio::select! {
                biased;
                joined = set.join_next() => match joined {
                    Some(Ok(stats)) => self.publish(stats),
                    Some(Err(e)) => {
                        error!(test_id = self.test_id.as_str(), error = %e, "worker task failed");
                        crashed += 1;
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }

        let stopped = cancel.is_cancelled();
        if !set.is_empty() {
            debug!(
                test_id = self.test_id.as_str(),
                remaining = set.len(),
                "waiting for workers to observe stop"
            );
            let drained = tokio::time::timeout(self.join_timeout, async {
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok(stats) => self.publish(stats),
                        Err(e) => {
                            error!(test_id = self.test_id.as_str(), error = %e, "worker task failed");
                            crashed += 1;
                        }
                    }
                }
            })
            .await;

            if drained.is_err() {
                set.abort_all();
                self.abandon_unfinished();
            }
        }

        JoinOutcome { crashed, stopped }
    }

    fn publish(&self, stats: WorkerStats) {
        self.inner.lock().results.push(stats);
    }

    /// Record last-known counters of workers that missed the join timeout.
    fn abandon_unfinished(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let finished: HashSet<u32> = inner.results.iter().map(|s| s.worker_id).collect();
        let abandoned: Vec<WorkerStats> = inner
            .live
            .iter()
            .filter(|p| !finished.contains(&p.worker_id()))
            .map(|p| {
                let mut stats = p.snapshot(now);
                stats.abandoned = true;
                stats
            })
            .collect();
        warn!(
            test_id = self.test_id.as_str(),
            abandoned = abandoned.len(),
            join_timeout_sec = self.join_timeout.as_secs_f64(),
            "workers did not stop within join timeout, abandoning"
        );
        inner.results.extend(abandoned);
    }

    fn finish(&self, state: RunState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.cancel = None;
        inner.live.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::UdpSocket;

    async fn sink_ports(count: usize) -> (Vec<UdpSocket>, Vec<u16>) {
        let mut socks = Vec::new();
        let mut ports = Vec::new();
        for _ in 0..count {
            let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            ports.push(sock.local_addr().unwrap().port());
            socks.push(sock);
        }
        (socks, ports)
    }

    fn config(ports: Vec<u16>, rate: u64, duration: u64, workers: u32) -> TrafficConfig {
        TrafficConfig {
            target: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports,
            packet_rate: rate,
            packet_size: 64,
            flows: 2,
            workers,
            duration_secs: duration,
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let cfg = config(vec![], 1000, 1, 2);
        let result = TrafficEngine::new(cfg, CancellationToken::new());
        assert!(matches!(result, Err(ConfigurationError::EmptyPorts)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_worker_scenario() {
        let (_socks, ports) = sink_ports(2).await;
        let engine = TrafficEngine::new(config(ports, 1000, 2, 2), CancellationToken::new()).unwrap();
        assert_eq!(engine.config().plan().pps_per_worker, 500);

        assert!(engine.start().await);
        assert_eq!(engine.state(), RunState::Completed);

        let stats = engine.statistics();
        assert_eq!(stats.workers, 2);
        assert!(stats.packets_sent >= 1800, "sent {}", stats.packets_sent);
        assert_eq!(stats.packets_failed, 0);
        // Workers overlap, so the aggregate span is about one run, not two.
        assert!(stats.duration_secs < 3.5, "duration {}", stats.duration_secs);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_lost_updates() {
        let (_socks, ports) = sink_ports(2).await;
        // 4 workers x 250 packets each.
        let engine = TrafficEngine::new(config(ports, 1000, 1, 4), CancellationToken::new()).unwrap();
        let plan = engine.config().plan();
        assert!(engine.start().await);

        let stats = engine.statistics();
        assert_eq!(stats.packets_sent, 4 * plan.packets_per_worker);
        assert_eq!(stats.bytes_sent, stats.packets_sent * 64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_mid_run() {
        let (_socks, ports) = sink_ports(2).await;
        let engine = Arc::new(
            TrafficEngine::new(config(ports, 200, 10, 2), CancellationToken::new())
                .unwrap()
                .with_join_timeout(Duration::from_secs(2)),
        );

        let runner = engine.clone();
        let run = tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.state(), RunState::Running);
        let live = engine.live_statistics();
        assert!(live.packets_sent > 0);

        let stop_at = std::time::Instant::now();
        engine.stop();
        let ok = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .expect("start() should return within interval + join timeout")
            .unwrap();
        assert!(ok);
        assert!(stop_at.elapsed() < Duration::from_secs(3));
        assert_eq!(engine.state(), RunState::Stopped);

        let stats = engine.statistics();
        assert!(stats.packets_sent < 2000, "sent {}", stats.packets_sent);
        assert_eq!(stats.abandoned_workers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parent_cancellation_stops_run() {
        let (_socks, ports) = sink_ports(2).await;
        let parent = CancellationToken::new();
        let engine = Arc::new(TrafficEngine::new(config(ports, 100, 30, 1), parent.clone()).unwrap());

        let runner = engine.clone();
        let run = tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        parent.cancel();

        assert!(tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap());
        assert_eq!(engine.state(), RunState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_start_rejected_while_running() {
        let (_socks, ports) = sink_ports(2).await;
        let engine = Arc::new(TrafficEngine::new(config(ports, 100, 30, 1), CancellationToken::new()).unwrap());

        let runner = engine.clone();
        let run = tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!engine.start().await);
        assert_eq!(engine.state(), RunState::Running);

        engine.stop();
        assert!(run.await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (_socks, ports) = sink_ports(1).await;
        let engine = TrafficEngine::new(config(ports, 100, 1, 1), CancellationToken::new()).unwrap();
        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), RunState::Idle);
        assert_eq!(engine.statistics(), AggregateStats::default());
    }

    #[tokio::test]
    async fn test_stop_between_begin_and_run_sends_nothing() {
        let (socks, ports) = sink_ports(1).await;
        let engine = TrafficEngine::new(config(ports, 1000, 5, 1), CancellationToken::new()).unwrap();
        assert!(engine.begin());
        assert_eq!(engine.state(), RunState::Running);
        engine.stop();

        assert!(engine.run().await);
        assert_eq!(engine.state(), RunState::Stopped);
        assert_eq!(engine.statistics().packets_sent, 0);

        let mut buf = [0u8; 128];
        let received = tokio::time::timeout(Duration::from_millis(200), socks[0].recv(&mut buf)).await;
        assert!(received.is_err(), "no packet should reach the sink");
    }

    #[tokio::test]
    async fn test_run_without_begin_is_rejected() {
        let (_socks, ports) = sink_ports(1).await;
        let engine = TrafficEngine::new(config(ports, 100, 1, 1), CancellationToken::new()).unwrap();
        assert!(!engine.run().await);
        assert_eq!(engine.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_join_timeout_abandons_workers_with_last_counters() {
        let (_socks, ports) = sink_ports(1).await;
        let engine = TrafficEngine::new(config(ports, 1000, 1, 2), CancellationToken::new())
            .unwrap()
            .with_join_timeout(Duration::from_millis(50));
        assert!(engine.begin());
        let cancel = engine.inner.lock().cancel.clone().unwrap();

        let quick = Arc::new(WorkerProgress::new(0));
        let stuck = Arc::new(WorkerProgress::new(1));
        engine.inner.lock().live = vec![quick.clone(), stuck.clone()];
        for _ in 0..7 {
            stuck.record_sent(64);
        }

        let mut set = JoinSet::new();
        set.spawn(async move {
            quick.record_sent(64);
            quick.snapshot(Utc::now())
        });
        // Ignores cancellation entirely.
        let ignored = stuck.clone();
        set.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ignored.snapshot(Utc::now())
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(2), engine.collect(&mut set, &cancel))
            .await
            .expect("join must be bounded by the join timeout");
        assert!(outcome.stopped);
        assert_eq!(outcome.crashed, 0);

        let stats = engine.statistics();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.abandoned_workers, 1);
        // The abandoned worker's last-known packets are kept.
        assert_eq!(stats.packets_sent, 8);
        assert_eq!(stats.bytes_sent, 8 * 64);

        let report = engine.report();
        assert_eq!(report.summary.abandoned_workers, 1);
        let abandoned: Vec<_> = report.workers.iter().filter(|w| w.abandoned).collect();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].worker_id, 1);
        assert_eq!(abandoned[0].packets_sent, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reset_returns_to_idle() {
        let (_socks, ports) = sink_ports(1).await;
        let engine = TrafficEngine::new(config(ports, 1000, 1, 1), CancellationToken::new()).unwrap();
        assert!(engine.start().await);
        assert_eq!(engine.state(), RunState::Completed);

        let cleared = engine.reset();
        assert_eq!(cleared.len(), 1);
        assert_eq!(engine.state(), RunState::Idle);
        assert_eq!(engine.statistics().packets_sent, 0);

        // Idle again, so a second run is accepted.
        assert!(engine.start().await);
        assert_eq!(engine.report().summary.total_packets_sent, 1000);
    }
}
