//! Source role: generates the traffic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Role;
use crate::config::NodeConfig;
use crate::control::handler::{to_payload, Handler, NodeCore};
use crate::control::messages::{
    unix_timestamp, ConfigPayload, MetricsResponse, NodeStatus, ResultsPayload, StartRequest,
    StatusResponse, StopRequest,
};
use crate::error::CoordinationError;
use crate::traffic::{TrafficEngine, TrafficReport};

/// Poll interval of [`SourceHandler::wait_for_completion`].
const COMPLETION_POLL: Duration = Duration::from_millis(100);

struct ActiveRun {
    engine: Arc<TrafficEngine>,
    task: JoinHandle<()>,
}

struct SourceState {
    core: NodeCore,
    active: Option<ActiveRun>,
}

/// Drives one [`TrafficEngine`] per test.
///
/// `start_test` returns as soon as the engine is launched; the run finishes
/// in a background task, or early through `stop_test`.
pub struct SourceHandler {
    state: Arc<Mutex<SourceState>>,
    cancel: CancellationToken,
}

impl SourceHandler {
    pub fn new(config: NodeConfig, cancel: CancellationToken) -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState {
                core: NodeCore::new(config),
                active: None,
            })),
            cancel,
        }
    }

    /// Wait until no test is running.
    pub async fn wait_for_completion(&self) {
        loop {
            if !self.state.lock().await.core.is_running() {
                return;
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        }
    }

    /// Report of the last finished run, if any.
    pub async fn last_report(&self) -> Option<TrafficReport> {
        let results = self.state.lock().await.core.results.clone();
        if results.is_empty() {
            return None;
        }
        serde_json::from_value(serde_json::Value::Object(results)).ok()
    }
}

/// Drive a run the engine has already begun and record its outcome, unless
/// `stop_test` already took over this run.
async fn run_to_completion(state: Arc<Mutex<SourceState>>, engine: Arc<TrafficEngine>) {
    let launched = engine.run().await;
    let report = engine.report();

    let mut st = state.lock().await;
    let is_current = st
        .active
        .as_ref()
        .is_some_and(|run| run.engine.test_id() == engine.test_id());
    if !is_current {
        return;
    }
    st.active = None;

    let status = NodeStatus::from(engine.state());
    if launched {
        info!(
            test_id = engine.test_id(),
            %status,
            summary = %report.summary_line(),
            "traffic generation finished"
        );
    } else {
        warn!(test_id = engine.test_id(), %status, "traffic generation failed");
    }
    st.core.finish(status, to_payload(&report));
}

#[async_trait]
impl Handler for SourceHandler {
    fn role(&self) -> Role {
        Role::Source
    }

    async fn get_status(&self) -> StatusResponse {
        self.state.lock().await.core.status_response(Role::Source)
    }

    async fn get_config(&self) -> ConfigPayload {
        self.state.lock().await.core.config.to_payload()
    }

    async fn update_config(&self, config: ConfigPayload) -> Result<bool, CoordinationError> {
        self.state.lock().await.core.update_config(config)
    }

    async fn start_test(&self, request: StartRequest) -> Result<bool, CoordinationError> {
        let mut st = self.state.lock().await;
        if st.core.is_running() {
            warn!("start_test rejected: a test is already running");
            return Ok(false);
        }

        let config = st.core.config.with_overrides(&request)?;
        let traffic = config.traffic_config()?;
        let engine = Arc::new(
            TrafficEngine::new(traffic, self.cancel.clone())?
                .with_join_timeout(config.control.join_timeout()),
        );

        info!(
            test_id = engine.test_id(),
            target = %engine.config().target,
            packet_rate = engine.config().packet_rate,
            duration_sec = engine.config().duration_secs,
            workers = engine.config().workers,
            "starting traffic generation"
        );

        if !engine.begin() {
            return Ok(false);
        }
        st.core.status = NodeStatus::Running;
        st.core.results.clear();
        let task = tokio::spawn(run_to_completion(self.state.clone(), engine.clone()));
        st.active = Some(ActiveRun { engine, task });
        Ok(true)
    }

    async fn stop_test(&self, _request: StopRequest) -> Result<ResultsPayload, CoordinationError> {
        let (run, join_timeout) = {
            let mut st = self.state.lock().await;
            (st.active.take(), st.core.config.control.join_timeout())
        };
        let Some(mut run) = run else {
            return Ok(ResultsPayload::new());
        };

        run.engine.stop();
        // The engine bounds its own worker join; allow the same again for
        // the task to observe it. Aborting the task drops its JoinSet, which
        // aborts any worker still sending.
        match tokio::time::timeout(join_timeout * 2, &mut run.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "traffic task ended abnormally"),
            Err(_) => {
                warn!(
                    test_id = run.engine.test_id(),
                    "traffic task did not finish after stop, aborting"
                );
                run.task.abort();
                let _ = run.task.await;
            }
        }

        let report = run.engine.report();
        let status = match NodeStatus::from(run.engine.state()) {
            NodeStatus::Running => NodeStatus::Stopped,
            other => other,
        };
        info!(
            test_id = run.engine.test_id(),
            %status,
            summary = %report.summary_line(),
            "traffic generation stopped"
        );

        let results = to_payload(&report);
        self.state.lock().await.core.finish(status, results.clone());
        Ok(results)
    }

    async fn get_results(&self) -> ResultsPayload {
        self.state.lock().await.core.retrieve_results()
    }

    async fn get_metrics(&self) -> MetricsResponse {
        let st = self.state.lock().await;
        MetricsResponse {
            status: st.core.status,
            timestamp: unix_timestamp(),
            role: Role::Source,
            test_active: st.core.is_running(),
            traffic: st.active.as_ref().map(|run| run.engine.live_statistics()),
            measurement: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    async fn handler_with_sink() -> (SourceHandler, UdpSocket) {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();
        let mut config = NodeConfig::default();
        config.network.dst_address = "127.0.0.1".into();
        config.network.traffic_ports = vec![port];
        config.control.join_timeout_sec = 2;
        (SourceHandler::new(config, CancellationToken::new()), sink)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_start_rejected_while_running() {
        let (handler, _sink) = handler_with_sink().await;
        assert!(handler.start_test(StartRequest::new(5.0, 200.0)).await.unwrap());
        assert!(!handler.start_test(StartRequest::new(5.0, 200.0)).await.unwrap());
        assert_eq!(handler.get_status().await.status, NodeStatus::Running);

        let results = handler.stop_test(StopRequest::default()).await.unwrap();
        assert!(results.contains_key("summary"));
        assert_eq!(handler.get_status().await.status, NodeStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_right_after_start_halts_traffic() {
        let (handler, sink) = handler_with_sink().await;
        let mut request = StartRequest::new(30.0, 100.0);
        request.workers = Some(1);
        assert!(handler.start_test(request).await.unwrap());

        let started = std::time::Instant::now();
        let results = handler.stop_test(StopRequest::default()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1), "stop took {:?}", started.elapsed());
        assert_eq!(handler.get_status().await.status, NodeStatus::Stopped);
        assert_eq!(results["summary"]["total_packets_sent"], 0);

        let mut buf = [0u8; 128];
        let received = tokio::time::timeout(Duration::from_millis(500), sink.recv(&mut buf)).await;
        assert!(received.is_err(), "traffic kept flowing after stop_test");

        // The node is free for the next run.
        assert!(handler.start_test(StartRequest::new(1.0, 100.0)).await.unwrap());
        handler.stop_test(StopRequest::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_on_idle_is_idempotent() {
        let (handler, _sink) = handler_with_sink().await;
        for _ in 0..2 {
            let results = handler.stop_test(StopRequest::default()).await.unwrap();
            assert!(results.is_empty());
            assert_eq!(handler.get_status().await.status, NodeStatus::Idle);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_natural_completion_records_report() {
        let (handler, _sink) = handler_with_sink().await;
        let mut request = StartRequest::new(1.0, 100.0);
        request.workers = Some(2);
        assert!(handler.start_test(request).await.unwrap());

        tokio::time::timeout(Duration::from_secs(5), handler.wait_for_completion())
            .await
            .expect("run should finish");
        assert_eq!(handler.get_status().await.status, NodeStatus::Completed);

        let report = handler.last_report().await.expect("report");
        assert_eq!(report.summary.total_packets_sent, 100);
        assert_eq!(report.workers.len(), 2);

        let results = handler.get_results().await;
        assert!(results.contains_key("performance"));
        assert_eq!(handler.get_status().await.status, NodeStatus::Idle);
    }

    #[tokio::test]
    async fn test_invalid_overrides_rejected_before_start() {
        let (handler, _sink) = handler_with_sink().await;
        let mut request = StartRequest::new(1.0, 100.0);
        request.workers = Some(65);
        let err = handler.start_test(request).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Configuration(_)));
        assert_eq!(handler.get_status().await.status, NodeStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metrics_show_live_traffic() {
        let (handler, _sink) = handler_with_sink().await;
        assert!(handler.start_test(StartRequest::new(5.0, 500.0)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let metrics = handler.get_metrics().await;
        assert!(metrics.test_active);
        assert!(metrics.traffic.expect("live stats").packets_sent > 0);

        handler.stop_test(StopRequest::default()).await.unwrap();
        assert!(handler.get_metrics().await.traffic.is_none());
    }
}
