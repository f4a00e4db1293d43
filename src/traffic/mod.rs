//! UDP traffic generation: paced workers, the engine that drives them, and
//! the statistics they produce.
//!
//! A [`TrafficConfig`] describes one test invocation. The [`TrafficEngine`]
//! splits its aggregate rate across `workers` [`PacedWorker`]s, each of which
//! sends a fixed number of packets to a round-robin list of flow targets.

pub mod engine;
pub mod payload;
pub mod stats;
pub mod worker;

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConfigurationError;

pub use engine::{RunState, TrafficEngine};
pub use stats::{AggregateStats, TrafficReport, WorkerStats};
pub use worker::PacedWorker;

/// Largest packet size accepted (jumbo frame).
pub const MAX_PACKET_SIZE: u32 = 9000;

/// Upper bound on concurrent workers per engine.
pub const MAX_WORKERS: u32 = 64;

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("failed to bind sender socket for worker {worker}: {source}")]
    SocketBind {
        worker: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} has no flow targets")]
    NoFlowTargets(u32),
}

// ---------------------------------------------------------------------------
// TrafficConfig
// ---------------------------------------------------------------------------

/// Immutable description of one traffic-generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Destination address every flow is sent to.
    pub target: IpAddr,
    /// Candidate destination ports, assigned to flows in order.
    pub ports: Vec<u16>,
    /// Aggregate packets per second across all workers.
    pub packet_rate: u64,
    /// Nominal on-wire packet size in bytes.
    pub packet_size: u32,
    /// Number of (address, port) flows.
    pub flows: u32,
    /// Number of concurrent workers.
    pub workers: u32,
    /// Test duration in seconds.
    pub duration_secs: u64,
}

/// Per-worker share of an aggregate [`TrafficConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerPlan {
    pub pps_per_worker: u64,
    pub packets_per_worker: u64,
}

impl TrafficConfig {
    /// Range-check every field, in a fixed order, returning the first failure.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.packet_rate == 0 {
            return Err(ConfigurationError::InvalidRate);
        }
        if self.packet_size == 0 || self.packet_size > MAX_PACKET_SIZE {
            return Err(ConfigurationError::InvalidPacketSize(self.packet_size));
        }
        if self.flows == 0 {
            return Err(ConfigurationError::InvalidFlowCount);
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(ConfigurationError::InvalidWorkerCount(self.workers));
        }
        if self.duration_secs == 0 {
            return Err(ConfigurationError::InvalidDuration);
        }
        if self.ports.is_empty() {
            return Err(ConfigurationError::EmptyPorts);
        }
        Ok(())
    }

    /// Split the aggregate rate and packet budget across workers.
    ///
    /// Integer division: the summed worker rates may fall short of the
    /// aggregate by less than `workers` packets/sec.
    pub fn plan(&self) -> WorkerPlan {
        let workers = u64::from(self.workers.max(1));
        let total_packets = self.packet_rate.saturating_mul(self.duration_secs);
        WorkerPlan {
            pps_per_worker: (self.packet_rate / workers).max(1),
            packets_per_worker: (total_packets / workers).max(1),
        }
    }

    /// Build the ordered flow target list: flow `i` goes to
    /// `ports[i % ports.len()]`.
    pub fn flow_targets(&self) -> Vec<SocketAddr> {
        if self.ports.is_empty() {
            return Vec::new();
        }
        (0..self.flows as usize)
            .map(|i| SocketAddr::new(self.target, self.ports[i % self.ports.len()]))
            .collect()
    }
}

/// Resolve a configured target (IP literal or hostname) to one address.
pub fn resolve_target(target: &str) -> Result<IpAddr, ConfigurationError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(ConfigurationError::EmptyTarget);
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }
    (target, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| ConfigurationError::InvalidTarget(target.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
