//! Flat JSON message types exchanged over the control plane.

use std::fmt;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoordinationError;
use crate::roles::measurement::{MeasurementCounters, MeasurementMode};
use crate::roles::Role;
use crate::traffic::{AggregateStats, RunState};

/// Free-form configuration object (`config` endpoint).
pub type ConfigPayload = Map<String, Value>;

/// Free-form results object (`results` and `stop_test`).
pub type ResultsPayload = Map<String, Value>;

/// Seconds since the Unix epoch with sub-second precision.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// NodeStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a node, as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    /// Configuration pushed, no test running.
    Ready,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Stopped
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RunState> for NodeStatus {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Idle => NodeStatus::Idle,
            RunState::Running => NodeStatus::Running,
            RunState::Completed => NodeStatus::Completed,
            RunState::Failed => NodeStatus::Failed,
            RunState::Stopped => NodeStatus::Stopped,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters of `start_test`. Only `duration` and `packet_rate` are
/// required; everything else overrides the node's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Seconds.
    pub duration: f64,
    /// Aggregate packets per second.
    pub packet_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flows: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<MeasurementMode>,
}

const REQUIRED_START_FIELDS: [&str; 2] = ["duration", "packet_rate"];

impl StartRequest {
    pub fn new(duration: f64, packet_rate: f64) -> Self {
        Self {
            duration,
            packet_rate,
            packet_size: None,
            flows: None,
            workers: None,
            target: None,
            ports: None,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: MeasurementMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Check the required fields are positive.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        for (field, value) in [("duration", self.duration), ("packet_rate", self.packet_rate)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(CoordinationError::Validation(format!(
                    "{field} must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Decode and validate an inbound request body.
    pub fn from_value(value: Value) -> Result<Self, CoordinationError> {
        let Value::Object(map) = &value else {
            return Err(CoordinationError::Validation(
                "request body must be a JSON object".into(),
            ));
        };
        for field in REQUIRED_START_FIELDS {
            match map.get(field) {
                None | Some(Value::Null) => {
                    return Err(CoordinationError::Validation(format!(
                        "missing required field: {field}"
                    )))
                }
                Some(v) if !v.is_number() => {
                    return Err(CoordinationError::Validation(format!(
                        "{field} must be a number"
                    )))
                }
                Some(_) => {}
            }
        }
        let req: Self = serde_json::from_value(value)
            .map_err(|e| CoordinationError::Validation(e.to_string()))?;
        req.validate()?;
        Ok(req)
    }
}

/// Parameters of `stop_test`. Currently empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopRequest {}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: NodeStatus,
    pub timestamp: f64,
    pub role: Role,
    pub test_active: bool,
}

/// Live snapshot served by `metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub status: NodeStatus,
    pub timestamp: f64,
    pub role: Role,
    pub test_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<AggregateStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement: Option<MeasurementCounters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status_code: u16,
    pub timestamp: f64,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            status_code: status.as_u16(),
            timestamp: unix_timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub hostname: String,
    pub os: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: f64,
    pub machine_info: MachineInfo,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: unix_timestamp(),
            machine_info: MachineInfo {
                hostname: hostname(),
                os: std::env::consts::OS.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Get the system hostname.
fn hostname() -> String {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Plain acknowledgement (`config updated`, `test started`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: String,
}

impl AckResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResponse {
    pub status: String,
    pub results: ResultsPayload,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_request_minimal() {
        let req = StartRequest::from_value(json!({"duration": 5, "packet_rate": 1000})).unwrap();
        assert_eq!(req, StartRequest::new(5.0, 1000.0));
    }

    #[test]
    fn test_start_request_with_overrides() {
        let req = StartRequest::from_value(json!({
            "duration": 1,
            "packet_rate": 10,
            "workers": 3,
            "ports": [7000, 7001],
            "mode": "baseline"
        }))
        .unwrap();
        assert_eq!(req.workers, Some(3));
        assert_eq!(req.ports, Some(vec![7000, 7001]));
        assert_eq!(req.mode, Some(MeasurementMode::Baseline));
    }

    #[test]
    fn test_start_request_rejections() {
        let cases = [
            json!([1, 2]),
            json!({"packet_rate": 10}),
            json!({"duration": 1}),
            json!({"duration": null, "packet_rate": 10}),
            json!({"duration": "10", "packet_rate": 10}),
            json!({"duration": 0, "packet_rate": 10}),
            json!({"duration": 1, "packet_rate": -5}),
            json!({"duration": 1, "packet_rate": 10, "workers": "many"}),
        ];
        for body in cases {
            let err = StartRequest::from_value(body.clone()).unwrap_err();
            assert!(
                matches!(err, CoordinationError::Validation(_)),
                "{body} -> {err:?}"
            );
        }
    }

    #[test]
    fn test_missing_field_message_names_field() {
        let err = StartRequest::from_value(json!({"duration": 1})).unwrap_err();
        assert_eq!(err.to_string(), "validation error: missing required field: packet_rate");
    }

    #[test]
    fn test_node_status_wire_names() {
        assert_eq!(serde_json::to_value(NodeStatus::Running).unwrap(), json!("running"));
        assert_eq!(NodeStatus::from(RunState::Stopped), NodeStatus::Stopped);
        assert!(NodeStatus::Completed.is_terminal());
        assert!(!NodeStatus::Ready.is_terminal());
    }

    #[test]
    fn test_error_response_shape() {
        let body = serde_json::to_value(ErrorResponse::new(StatusCode::NOT_FOUND, "not found")).unwrap();
        assert_eq!(body["error"], "not found");
        assert_eq!(body["status_code"], 404);
        assert!(body["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_health_response() {
        let health = HealthResponse::healthy();
        assert_eq!(health.status, "healthy");
        assert!(!health.machine_info.hostname.is_empty());
        assert_eq!(health.machine_info.version, env!("CARGO_PKG_VERSION"));
    }
}
