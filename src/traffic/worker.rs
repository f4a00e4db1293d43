//! Rate-paced UDP sender.
//!
//! A [`PacedWorker`] sends a bounded number of copies of one payload to a
//! round-robin list of flow targets. Pacing is deadline based: the deadline
//! advances by one interval after every attempt and is never reset from the
//! current time, so the worker neither drifts nor bursts to catch up by more
//! than the slack it already accumulated.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stats::{WorkerProgress, WorkerStats};
use super::TrafficError;

/// Gaps shorter than this are not slept; coarse timers would oversleep them.
pub const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Send failures logged per worker before they are only counted.
pub const FAILURE_LOG_LIMIT: u64 = 10;

/// Progress is logged every this many packets.
const PROGRESS_EVERY: u64 = 10_000;

/// Bind an unconnected UDP socket of the same family as `target`.
pub async fn bind_sender(target: &SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    UdpSocket::bind(local).await
}

// ---------------------------------------------------------------------------
// PacedWorker
// ---------------------------------------------------------------------------

pub struct PacedWorker {
    id: u32,
    interval: Duration,
    total_packets: u64,
    payload: Bytes,
    targets: Arc<[SocketAddr]>,
    socket: UdpSocket,
    cancel: CancellationToken,
    progress: Arc<WorkerProgress>,
}

impl PacedWorker {
    /// Create a worker sending `total_packets` at `rate_per_sec`.
    ///
    /// A zero rate or packet count is raised to one.
    pub fn new(
        id: u32,
        rate_per_sec: u64,
        total_packets: u64,
        payload: Bytes,
        targets: Arc<[SocketAddr]>,
        socket: UdpSocket,
        cancel: CancellationToken,
    ) -> Result<Self, TrafficError> {
        if targets.is_empty() {
            return Err(TrafficError::NoFlowTargets(id));
        }
        Ok(Self {
            id,
            interval: Duration::from_secs_f64(1.0 / rate_per_sec.max(1) as f64),
            total_packets: total_packets.max(1),
            payload,
            targets,
            socket,
            cancel,
            progress: Arc::new(WorkerProgress::new(id)),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Pacing interval between consecutive send attempts.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Live counters, shared with the engine for mid-run metrics.
    pub fn progress(&self) -> Arc<WorkerProgress> {
        self.progress.clone()
    }

    /// Run until `total_packets` attempts were made or the cancellation
    /// token fires. Send failures are counted and never end the run.
    pub async fn run(self) -> WorkerStats {
        debug!(
            worker = self.id,
            interval_us = self.interval.as_micros() as u64,
            packets = self.total_packets,
            flows = self.targets.len(),
            "worker starting"
        );

        let mut next_deadline = Instant::now();
        let mut attempts: u64 = 0;
        let mut flow_index: usize = 0;

        while attempts < self.total_packets {
            if self.cancel.is_cancelled() {
                break;
            }

            let now = Instant::now();
            if next_deadline > now && next_deadline - now >= MIN_SLEEP {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(next_deadline) => {}
                }
            }

            let target = self.targets[flow_index % self.targets.len()];
            match self.socket.send_to(&self.payload, target).await {
                Ok(sent) => self.progress.record_sent(sent as u64),
                Err(e) => {
                    let failed = self.progress.record_failure();
                    if failed <= FAILURE_LOG_LIMIT {
                        warn!(worker = self.id, %target, error = %e, "send failed");
                    }
                }
            }

            flow_index = flow_index.wrapping_add(1);
            attempts += 1;
            next_deadline += self.interval;

            if attempts % PROGRESS_EVERY == 0 {
                debug!(
                    worker = self.id,
                    packets = self.progress.packets_sent(),
                    "worker progress"
                );
            }
        }

        let stats = self.progress.snapshot(Utc::now());
        info!(
            worker = self.id,
            packets_sent = stats.packets_sent,
            packets_failed = stats.packets_failed,
            duration_sec = stats.duration_secs(),
            pps = stats.pps() as u64,
            "worker finished"
        );
        stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn receiver() -> (UdpSocket, SocketAddr) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind receiver");
        let addr = sock.local_addr().expect("receiver addr");
        (sock, addr)
    }

    fn payload() -> Bytes {
        Bytes::from_static(&[0xAB; 64])
    }

    #[tokio::test]
    async fn test_worker_sends_exact_count_round_robin() {
        let (rx_a, addr_a) = receiver().await;
        let (rx_b, addr_b) = receiver().await;
        let targets: Arc<[SocketAddr]> = vec![addr_a, addr_b].into();
        let socket = bind_sender(&addr_a).await.unwrap();

        let worker = PacedWorker::new(
            0,
            1000,
            10,
            payload(),
            targets,
            socket,
            CancellationToken::new(),
        )
        .unwrap();
        let stats = worker.run().await;

        assert_eq!(stats.packets_sent, 10);
        assert_eq!(stats.bytes_sent, 640);
        assert_eq!(stats.packets_failed, 0);
        assert!(stats.ended_at >= stats.started_at);

        let mut buf = [0u8; 128];
        for sock in [&rx_a, &rx_b] {
            for _ in 0..5 {
                let (len, _) = tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
                    .await
                    .expect("timed out waiting for packet")
                    .expect("recv");
                assert_eq!(len, 64);
            }
        }
    }

    #[tokio::test]
    async fn test_worker_paces_to_rate() {
        let (_rx, addr) = receiver().await;
        let socket = bind_sender(&addr).await.unwrap();
        let worker = PacedWorker::new(
            0,
            100,
            20,
            payload(),
            vec![addr].into(),
            socket,
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(worker.interval(), Duration::from_millis(10));

        let started = std::time::Instant::now();
        let stats = worker.run().await;
        let elapsed = started.elapsed();

        assert_eq!(stats.packets_sent, 20);
        // 20 packets at 100 pps: the last deadline is 190ms after the first.
        assert!(elapsed >= Duration::from_millis(180), "too fast: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "too slow: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let (_rx, addr) = receiver().await;
        let socket = bind_sender(&addr).await.unwrap();
        let cancel = CancellationToken::new();
        let worker = PacedWorker::new(
            0,
            10,
            1_000,
            payload(),
            vec![addr].into(),
            socket,
            cancel.clone(),
        )
        .unwrap();

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should observe cancellation promptly")
            .expect("worker task");
        assert!(stats.packets_sent > 0);
        assert!(stats.packets_sent < 1_000);
    }

    #[tokio::test]
    async fn test_send_failures_are_counted_not_fatal() {
        // An IPv4 socket cannot send to an IPv6 destination.
        let v4_target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let v6_target: SocketAddr = "[::1]:9".parse().unwrap();
        let socket = bind_sender(&v4_target).await.unwrap();

        let worker = PacedWorker::new(
            1,
            10_000,
            25,
            payload(),
            vec![v6_target].into(),
            socket,
            CancellationToken::new(),
        )
        .unwrap();
        let stats = worker.run().await;

        assert_eq!(stats.packets_sent, 0);
        assert_eq!(stats.packets_failed, 25);
    }

    #[tokio::test]
    async fn test_worker_requires_targets() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let socket = bind_sender(&addr).await.unwrap();
        let result = PacedWorker::new(
            4,
            10,
            10,
            payload(),
            Vec::<SocketAddr>::new().into(),
            socket,
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(TrafficError::NoFlowTargets(4))));
    }
}
