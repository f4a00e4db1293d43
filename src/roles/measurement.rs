//! Measurement collaborator consumed by the destination role.
//!
//! The collaborator attaches whatever is being measured (the fast-path
//! program or the userspace baseline), and exposes its counters. How those
//! counters are produced is outside this crate: [`ProcessCollaborator`] runs
//! an external loader that writes them to a JSON file, [`StubCollaborator`]
//! holds counters set by tests.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{MeasurementSettings, NodeConfig};

/// How long an unloading loader gets to exit after SIGTERM.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("loader exited during startup ({status}): {stderr}")]
    LoaderExited { status: String, stderr: String },

    #[error("counters unavailable: {0}")]
    StatsUnavailable(String),

    #[error("measurement collaborator failed: {0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// MeasurementMode
// ---------------------------------------------------------------------------

/// What the destination node measures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementMode {
    /// Fast-path program attached to the interface.
    #[default]
    Xdp,
    /// Userspace packet capture, for comparison.
    Baseline,
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementMode::Xdp => f.write_str("xdp"),
            MeasurementMode::Baseline => f.write_str("baseline"),
        }
    }
}

impl FromStr for MeasurementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xdp" => Ok(MeasurementMode::Xdp),
            "baseline" => Ok(MeasurementMode::Baseline),
            other => Err(format!("unknown measurement mode '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// MeasurementCounters
// ---------------------------------------------------------------------------

/// One sample of the measured program's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementCounters {
    pub packets_seen: u64,
    pub packets_processed: u64,
    pub packets_dropped: u64,
    pub features_extracted: u64,
    pub avg_latency_ns: f64,
    pub min_latency_ns: f64,
    pub max_latency_ns: f64,
    /// Unix seconds the sample was taken.
    pub timestamp: f64,
}

impl MeasurementCounters {
    pub fn drop_rate_percent(&self) -> f64 {
        if self.packets_seen == 0 {
            return 0.0;
        }
        self.packets_dropped as f64 / self.packets_seen as f64 * 100.0
    }

    pub fn processing_rate_percent(&self) -> f64 {
        if self.packets_seen == 0 {
            return 0.0;
        }
        self.packets_processed as f64 / self.packets_seen as f64 * 100.0
    }

    /// Counter growth since `earlier`. Latencies are taken from `self`.
    pub fn delta_since(&self, earlier: &MeasurementCounters) -> MeasurementCounters {
        MeasurementCounters {
            packets_seen: self.packets_seen.saturating_sub(earlier.packets_seen),
            packets_processed: self.packets_processed.saturating_sub(earlier.packets_processed),
            packets_dropped: self.packets_dropped.saturating_sub(earlier.packets_dropped),
            features_extracted: self
                .features_extracted
                .saturating_sub(earlier.features_extracted),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MeasurementCollaborator: Send + Sync {
    /// Attach the measured program. Loading twice is a no-op.
    async fn load(&self, mode: MeasurementMode) -> Result<(), MeasurementError>;

    /// Detach it. Counters remain readable afterwards.
    async fn unload(&self) -> Result<(), MeasurementError>;

    /// Current counters, available while loaded and once more after unload.
    async fn read_stats(&self) -> Result<MeasurementCounters, MeasurementError>;

    fn is_loaded(&self) -> bool;
}

// ---------------------------------------------------------------------------
// ProcessCollaborator
// ---------------------------------------------------------------------------

/// Runs an external loader process and reads the JSON counters it writes.
///
/// - xdp: `<loader_path> <interface> <program_path> --mode <attach_mode>`
/// - baseline: `<baseline_path> <interface> --mode packet_capture`
pub struct ProcessCollaborator {
    interface: String,
    settings: MeasurementSettings,
    child: Mutex<Option<Child>>,
    loaded: AtomicBool,
}

impl ProcessCollaborator {
    pub fn new(interface: impl Into<String>, settings: MeasurementSettings) -> Self {
        Self {
            interface: interface.into(),
            settings,
            child: Mutex::new(None),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.network.interface.clone(), config.measurement.clone())
    }

    fn command(&self, mode: MeasurementMode) -> Command {
        let mut cmd = match mode {
            MeasurementMode::Xdp => {
                let mut cmd = Command::new(&self.settings.loader_path);
                cmd.arg(&self.interface)
                    .arg(&self.settings.program_path)
                    .arg("--mode")
                    .arg(&self.settings.attach_mode);
                cmd
            }
            MeasurementMode::Baseline => {
                let mut cmd = Command::new(&self.settings.baseline_path);
                cmd.arg(&self.interface).arg("--mode").arg("packet_capture");
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn program_name(&self, mode: MeasurementMode) -> &str {
        match mode {
            MeasurementMode::Xdp => &self.settings.loader_path,
            MeasurementMode::Baseline => &self.settings.baseline_path,
        }
    }
}

#[async_trait]
impl MeasurementCollaborator for ProcessCollaborator {
    async fn load(&self, mode: MeasurementMode) -> Result<(), MeasurementError> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            warn!(%mode, "measurement already loaded");
            return Ok(());
        }

        let program = self.program_name(mode).to_string();
        info!(%mode, interface = %self.interface, %program, "loading measurement program");
        let mut child = self
            .command(mode)
            .spawn()
            .map_err(|source| MeasurementError::Spawn {
                program: program.clone(),
                source,
            })?;

        tokio::time::sleep(Duration::from_millis(self.settings.startup_grace_ms)).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(MeasurementError::LoaderExited {
                    status: status.to_string(),
                    stderr: stderr.trim().to_string(),
                });
            }
            Ok(None) => {}
            Err(e) => return Err(MeasurementError::Other(e.to_string())),
        }

        *slot = Some(child);
        self.loaded.store(true, Ordering::SeqCst);
        info!(%mode, "measurement program loaded");
        Ok(())
    }

    async fn unload(&self) -> Result<(), MeasurementError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        self.loaded.store(false, Ordering::SeqCst);
        let status = stop_loader(&mut child).await;
        info!(exit_status = ?status, "measurement program unloaded");
        Ok(())
    }

    async fn read_stats(&self) -> Result<MeasurementCounters, MeasurementError> {
        let path = PathBuf::from(&self.settings.stats_path);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            MeasurementError::StatsUnavailable(format!("{}: {e}", path.display()))
        })?;
        let mut counters: MeasurementCounters = serde_json::from_str(&content).map_err(|e| {
            MeasurementError::StatsUnavailable(format!("{}: {e}", path.display()))
        })?;
        if counters.timestamp == 0.0 {
            counters.timestamp = crate::control::messages::unix_timestamp();
        }
        Ok(counters)
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }
}

/// Stop the loader: SIGTERM lets it detach the program from the interface;
/// a loader still alive after [`TERMINATE_GRACE`] is killed.
async fn stop_loader(child: &mut Child) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
            // SAFETY: `pid` is our own child and has not been reaped yet.
            if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM not delivered");
            }
        }
    }

    let waited = match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(waited) => waited,
        Err(_) => {
            warn!(grace_sec = TERMINATE_GRACE.as_secs(), "loader ignored SIGTERM, killing it");
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to kill loader");
            }
            child.wait().await
        }
    };
    waited
        .map_err(|e| warn!(error = %e, "failed to reap loader"))
        .ok()
}

// ---------------------------------------------------------------------------
// StubCollaborator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StubState {
    mode: Option<MeasurementMode>,
    counters: MeasurementCounters,
    loads: u32,
    fail_load: bool,
    load_delay: Duration,
}

/// In-memory collaborator whose counters are set by the caller.
///
/// For tests and dry runs; its numbers are never real measurements.
#[derive(Debug, Default)]
pub struct StubCollaborator {
    state: parking_lot::Mutex<StubState>,
}

impl StubCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stub whose `load` always fails.
    pub fn failing() -> Self {
        let stub = Self::default();
        stub.state.lock().fail_load = true;
        stub
    }

    /// A stub whose `load` takes `delay`, like a loader's startup grace.
    pub fn with_load_delay(self, delay: Duration) -> Self {
        self.state.lock().load_delay = delay;
        self
    }

    pub fn set_counters(&self, counters: MeasurementCounters) {
        self.state.lock().counters = counters;
    }

    pub fn loaded_mode(&self) -> Option<MeasurementMode> {
        self.state.lock().mode
    }

    pub fn load_count(&self) -> u32 {
        self.state.lock().loads
    }
}

#[async_trait]
impl MeasurementCollaborator for StubCollaborator {
    async fn load(&self, mode: MeasurementMode) -> Result<(), MeasurementError> {
        let delay = {
            let state = self.state.lock();
            if state.fail_load {
                return Err(MeasurementError::Other("stub configured to fail".into()));
            }
            state.load_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.mode.is_none() {
            state.mode = Some(mode);
            state.loads += 1;
        }
        Ok(())
    }

    async fn unload(&self) -> Result<(), MeasurementError> {
        self.state.lock().mode = None;
        Ok(())
    }

    async fn read_stats(&self) -> Result<MeasurementCounters, MeasurementError> {
        let mut counters = self.state.lock().counters.clone();
        counters.timestamp = crate::control::messages::unix_timestamp();
        Ok(counters)
    }

    fn is_loaded(&self) -> bool {
        self.state.lock().mode.is_some()
    }
}
