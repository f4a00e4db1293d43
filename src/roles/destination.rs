//! Destination role: runs the program under test and reports its counters.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::measurement::{MeasurementCollaborator, MeasurementCounters, MeasurementMode};
use super::Role;
use crate::config::NodeConfig;
use crate::control::handler::{to_payload, Handler, NodeCore};
use crate::control::messages::{
    unix_timestamp, ConfigPayload, MetricsResponse, NodeStatus, ResultsPayload, StartRequest,
    StatusResponse, StopRequest,
};
use crate::error::CoordinationError;

/// Samples kept per test; the oldest are dropped first.
pub const HISTORY_LIMIT: usize = 1000;

/// Interval of the background sampler while a test runs.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// What `stop_test` returns for a destination node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationResults {
    pub mode: MeasurementMode,
    pub timestamp: f64,
    pub measurement: MeasurementSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSummary {
    pub latest: MeasurementCounters,
    pub first: MeasurementCounters,
    /// Growth between the first and the latest sample.
    pub delta: MeasurementCounters,
    pub drop_rate_percent: f64,
    pub processing_rate_percent: f64,
    pub sample_count: usize,
}

impl MeasurementSummary {
    fn from_history(history: &VecDeque<MeasurementCounters>) -> Option<Self> {
        let first = history.front()?.clone();
        let latest = history.back()?.clone();
        let delta = latest.delta_since(&first);
        Some(Self {
            drop_rate_percent: delta.drop_rate_percent(),
            processing_rate_percent: delta.processing_rate_percent(),
            sample_count: history.len(),
            latest,
            first,
            delta,
        })
    }
}

struct Sampler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct DestinationState {
    core: NodeCore,
    mode: Option<MeasurementMode>,
    /// Bumped by every `start_test`; a start whose load finishes after its
    /// run was stopped sees a different value or no mode.
    run: u64,
    history: VecDeque<MeasurementCounters>,
    sampler: Option<Sampler>,
}

impl DestinationState {
    fn is_current(&self, run: u64) -> bool {
        self.run == run && self.mode.is_some() && self.core.is_running()
    }

    fn record(&mut self, sample: MeasurementCounters) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }
}

/// Loads the measured program on `start_test` and unloads it on `stop_test`,
/// sampling its counters in between.
pub struct DestinationHandler {
    state: Arc<Mutex<DestinationState>>,
    collaborator: Arc<dyn MeasurementCollaborator>,
    cancel: CancellationToken,
    sample_interval: Duration,
}

impl DestinationHandler {
    pub fn new(
        config: NodeConfig,
        collaborator: Arc<dyn MeasurementCollaborator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(DestinationState {
                core: NodeCore::new(config),
                mode: None,
                run: 0,
                history: VecDeque::new(),
                sampler: None,
            })),
            collaborator,
            cancel,
            sample_interval: SAMPLE_INTERVAL,
        }
    }

    pub fn with_sample_interval(mut self, sample_interval: Duration) -> Self {
        self.sample_interval = sample_interval;
        self
    }

    /// Samples collected for the current or last test.
    pub async fn sample_count(&self) -> usize {
        self.state.lock().await.history.len()
    }

    async fn sample(&self) -> Option<MeasurementCounters> {
        match self.collaborator.read_stats().await {
            Ok(sample) => {
                self.state.lock().await.record(sample.clone());
                Some(sample)
            }
            Err(e) => {
                warn!(error = %e, "failed to read measurement counters");
                None
            }
        }
    }

    fn spawn_sampler(&self) -> Sampler {
        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let state = self.state.clone();
        let collaborator = self.collaborator.clone();
        let interval = self.sample_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match collaborator.read_stats().await {
                    Ok(sample) => state.lock().await.record(sample),
                    Err(e) => debug!(error = %e, "sampler could not read counters"),
                }
            }
        });
        Sampler { cancel, task }
    }
}

#[async_trait]
impl Handler for DestinationHandler {
    fn role(&self) -> Role {
        Role::Destination
    }

    async fn get_status(&self) -> StatusResponse {
        self.state.lock().await.core.status_response(Role::Destination)
    }

    async fn get_config(&self) -> ConfigPayload {
        self.state.lock().await.core.config.to_payload()
    }

    async fn update_config(&self, config: ConfigPayload) -> Result<bool, CoordinationError> {
        self.state.lock().await.core.update_config(config)
    }

    async fn start_test(&self, request: StartRequest) -> Result<bool, CoordinationError> {
        let (mode, run) = {
            let mut st = self.state.lock().await;
            if st.core.is_running() {
                warn!("start_test rejected: a test is already running");
                return Ok(false);
            }
            let mode = request.mode.unwrap_or(st.core.config.test.mode);
            // Held as running while the collaborator loads so a concurrent
            // start is rejected.
            st.core.status = NodeStatus::Running;
            st.core.results.clear();
            st.history.clear();
            st.mode = Some(mode);
            st.run += 1;
            (mode, st.run)
        };

        info!(%mode, duration_sec = request.duration, "starting measurement");
        if let Err(e) = self.collaborator.load(mode).await {
            error!(%mode, error = %e, "failed to load measurement program");
            let mut st = self.state.lock().await;
            if st.is_current(run) {
                st.core.status = NodeStatus::Failed;
                st.mode = None;
            }
            return Ok(false);
        }

        let first = self.collaborator.read_stats().await;
        let mut st = self.state.lock().await;
        if !st.is_current(run) {
            drop(st);
            warn!(%mode, "test stopped while loading, unloading measurement program");
            if let Err(e) = self.collaborator.unload().await {
                error!(%mode, error = %e, "failed to unload measurement program");
            }
            return Ok(false);
        }
        match first {
            Ok(sample) => st.record(sample),
            Err(e) => warn!(error = %e, "failed to read measurement counters"),
        }
        st.sampler = Some(self.spawn_sampler());
        Ok(true)
    }

    async fn stop_test(&self, _request: StopRequest) -> Result<ResultsPayload, CoordinationError> {
        let (mode, sampler) = {
            let mut st = self.state.lock().await;
            if !st.core.is_running() {
                debug!("stop_test with no active test");
                return Ok(ResultsPayload::new());
            }
            (st.mode.take(), st.sampler.take())
        };
        let mode = mode.unwrap_or_default();

        if let Some(sampler) = sampler {
            sampler.cancel.cancel();
            if let Err(e) = sampler.task.await {
                warn!(error = %e, "sampler task ended abnormally");
            }
        }

        if let Err(e) = self.collaborator.unload().await {
            error!(%mode, error = %e, "failed to unload measurement program");
        }
        self.sample().await;

        let mut st = self.state.lock().await;
        let Some(measurement) = MeasurementSummary::from_history(&st.history) else {
            warn!(%mode, "no measurement samples were collected");
            st.core.finish(NodeStatus::Failed, ResultsPayload::new());
            return Err(CoordinationError::Protocol(
                "no measurement samples were collected".into(),
            ));
        };
        info!(
            %mode,
            samples = measurement.sample_count,
            packets_seen = measurement.delta.packets_seen,
            drop_rate = measurement.drop_rate_percent,
            "measurement stopped"
        );
        let results = to_payload(&DestinationResults {
            mode,
            timestamp: unix_timestamp(),
            measurement,
        });
        st.core.finish(NodeStatus::Completed, results.clone());
        Ok(results)
    }

    async fn get_results(&self) -> ResultsPayload {
        self.state.lock().await.core.retrieve_results()
    }

    async fn get_metrics(&self) -> MetricsResponse {
        let running = self.state.lock().await.core.is_running();
        let measurement = if running && self.collaborator.is_loaded() {
            self.sample().await
        } else {
            None
        };
        let st = self.state.lock().await;
        MetricsResponse {
            status: st.core.status,
            timestamp: unix_timestamp(),
            role: Role::Destination,
            test_active: st.core.is_running(),
            traffic: None,
            measurement,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::measurement::StubCollaborator;

    fn counters(seen: u64, processed: u64, dropped: u64) -> MeasurementCounters {
        MeasurementCounters {
            packets_seen: seen,
            packets_processed: processed,
            packets_dropped: dropped,
            ..Default::default()
        }
    }

    fn handler(stub: Arc<StubCollaborator>) -> DestinationHandler {
        DestinationHandler::new(NodeConfig::default(), stub, CancellationToken::new())
            .with_sample_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_start_stop_reports_delta() {
        let stub = Arc::new(StubCollaborator::new());
        let handler = handler(stub.clone());

        stub.set_counters(counters(100, 95, 5));
        let request = StartRequest::new(1.0, 1000.0).with_mode(MeasurementMode::Baseline);
        assert!(handler.start_test(request).await.unwrap());
        assert_eq!(stub.loaded_mode(), Some(MeasurementMode::Baseline));
        assert_eq!(handler.get_status().await.status, NodeStatus::Running);

        stub.set_counters(counters(1100, 1045, 55));
        let results = handler.stop_test(StopRequest::default()).await.unwrap();
        assert!(!stub.is_loaded());

        let parsed: DestinationResults =
            serde_json::from_value(serde_json::Value::Object(results)).unwrap();
        assert_eq!(parsed.mode, MeasurementMode::Baseline);
        assert_eq!(parsed.measurement.delta.packets_seen, 1000);
        assert_eq!(parsed.measurement.delta.packets_dropped, 50);
        assert!((parsed.measurement.drop_rate_percent - 5.0).abs() < 1e-9);
        assert!(parsed.measurement.sample_count >= 2);
        assert_eq!(handler.get_status().await.status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_default_mode_from_config() {
        let stub = Arc::new(StubCollaborator::new());
        let handler = handler(stub.clone());
        assert!(handler.start_test(StartRequest::new(1.0, 10.0)).await.unwrap());
        assert_eq!(stub.loaded_mode(), Some(MeasurementMode::Xdp));
        handler.stop_test(StopRequest::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let stub = Arc::new(StubCollaborator::new());
        let handler = handler(stub.clone());
        assert!(handler.start_test(StartRequest::new(1.0, 10.0)).await.unwrap());
        assert!(!handler.start_test(StartRequest::new(1.0, 10.0)).await.unwrap());
        assert_eq!(stub.load_count(), 1);
        handler.stop_test(StopRequest::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_failure_marks_failed() {
        let handler = handler(Arc::new(StubCollaborator::failing()));
        assert!(!handler.start_test(StartRequest::new(1.0, 10.0)).await.unwrap());
        assert_eq!(handler.get_status().await.status, NodeStatus::Failed);
        assert!(handler.stop_test(StopRequest::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_empty_twice() {
        let handler = handler(Arc::new(StubCollaborator::new()));
        for _ in 0..2 {
            assert!(handler.stop_test(StopRequest::default()).await.unwrap().is_empty());
            assert_eq!(handler.get_status().await.status, NodeStatus::Idle);
        }
    }

    #[tokio::test]
    async fn test_sampler_collects_and_metrics_sample() {
        let stub = Arc::new(StubCollaborator::new());
        let handler = handler(stub.clone());
        stub.set_counters(counters(10, 10, 0));
        assert!(handler.start_test(StartRequest::new(1.0, 10.0)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(handler.sample_count().await >= 3);

        let metrics = handler.get_metrics().await;
        assert!(metrics.test_active);
        assert_eq!(metrics.measurement.unwrap().packets_seen, 10);

        handler.stop_test(StopRequest::default()).await.unwrap();
        assert!(handler.get_metrics().await.measurement.is_none());
    }

    #[tokio::test]
    async fn test_stop_during_load_leaves_nothing_running() {
        let stub = Arc::new(StubCollaborator::new().with_load_delay(Duration::from_millis(200)));
        let handler = Arc::new(handler(stub.clone()));
        stub.set_counters(counters(10, 10, 0));

        let starter = handler.clone();
        let start = tokio::spawn(async move { starter.start_test(StartRequest::new(5.0, 10.0)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.get_status().await.status, NodeStatus::Running);

        handler.stop_test(StopRequest::default()).await.unwrap();
        assert_eq!(handler.get_status().await.status, NodeStatus::Completed);

        // The late load is undone and no sampler is left behind.
        assert!(!start.await.unwrap().unwrap());
        assert!(!stub.is_loaded());
        let samples = handler.sample_count().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.sample_count().await, samples);
        assert_eq!(handler.get_status().await.status, NodeStatus::Completed);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = DestinationState {
            core: NodeCore::new(NodeConfig::default()),
            mode: None,
            run: 0,
            history: VecDeque::new(),
            sampler: None,
        };
        for i in 0..(HISTORY_LIMIT as u64 + 50) {
            state.record(counters(i, i, 0));
        }
        assert_eq!(state.history.len(), HISTORY_LIMIT);
        assert_eq!(state.history.front().unwrap().packets_seen, 50);
    }
}
