//! The role-specific operation set behind the control-plane endpoints.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::messages::{
    unix_timestamp, ConfigPayload, MetricsResponse, NodeStatus, ResultsPayload, StartRequest,
    StatusResponse, StopRequest,
};
use crate::config::NodeConfig;
use crate::error::CoordinationError;
use crate::roles::Role;

/// Operations a node exposes to its peer.
///
/// Implemented once per [`Role`] and attached to the server at construction.
/// `Ok(false)` from `update_config`/`start_test` means the request was
/// understood but declined; errors carry the reason.
#[async_trait]
pub trait Handler: Send + Sync {
    fn role(&self) -> Role;

    async fn get_status(&self) -> StatusResponse;

    async fn get_config(&self) -> ConfigPayload;

    async fn update_config(&self, config: ConfigPayload) -> Result<bool, CoordinationError>;

    async fn start_test(&self, request: StartRequest) -> Result<bool, CoordinationError>;

    /// Stop the running test and return its final results. Returns an empty
    /// map when nothing is running.
    async fn stop_test(&self, request: StopRequest) -> Result<ResultsPayload, CoordinationError>;

    /// Results of the last finished test. A terminal node returns to idle.
    async fn get_results(&self) -> ResultsPayload;

    async fn get_metrics(&self) -> MetricsResponse;
}

// ---------------------------------------------------------------------------
// NodeCore
// ---------------------------------------------------------------------------

/// Status, configuration and last results shared by every role.
#[derive(Debug, Clone)]
pub struct NodeCore {
    pub status: NodeStatus,
    pub config: NodeConfig,
    pub results: ResultsPayload,
}

impl NodeCore {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            status: NodeStatus::Idle,
            config,
            results: ResultsPayload::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == NodeStatus::Running
    }

    pub fn status_response(&self, role: Role) -> StatusResponse {
        StatusResponse {
            status: self.status,
            timestamp: unix_timestamp(),
            role,
            test_active: self.is_running(),
        }
    }

    /// Deep-merge a pushed configuration. Rejected while a test runs.
    pub fn update_config(&mut self, payload: ConfigPayload) -> Result<bool, CoordinationError> {
        if self.is_running() {
            return Err(CoordinationError::Rejected(
                "cannot update configuration while a test is running".into(),
            ));
        }
        let keys: Vec<String> = payload.keys().cloned().collect();
        self.config = self.config.merged_with(&Value::Object(payload))?;
        if self.status == NodeStatus::Idle {
            self.status = NodeStatus::Ready;
        }
        info!(sections = ?keys, "configuration updated");
        Ok(true)
    }

    /// Record a finished test.
    pub fn finish(&mut self, status: NodeStatus, results: ResultsPayload) {
        self.status = status;
        self.results = results;
    }

    /// Hand out the last results; a terminal node goes back to idle.
    pub fn retrieve_results(&mut self) -> ResultsPayload {
        if self.status.is_terminal() {
            self.status = NodeStatus::Idle;
        }
        self.results.clone()
    }
}

/// Serialize a results value into a flat payload map.
pub fn to_payload<T: serde::Serialize>(value: &T) -> ResultsPayload {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => ResultsPayload::new(),
    }
}
