//! Two-node test driven from the source side.
//!
//! Waits for the destination, pushes configuration, starts the remote
//! measurement, generates traffic locally, then stops the remote side and
//! combines both result sets.

use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::control::handler::Handler;
use crate::control::messages::{StartRequest, StopRequest};
use crate::control::ControlPlaneClient;
use crate::error::CoordinationError;
use crate::roles::SourceHandler;

/// The start request for the configured test.
pub fn start_request(config: &NodeConfig) -> StartRequest {
    let mut request =
        StartRequest::new(config.test.duration as f64, config.traffic.packet_rate as f64)
            .with_mode(config.test.mode);
    request.packet_size = Some(config.traffic.packet_size);
    request.flows = Some(config.traffic.flows);
    request.workers = Some(config.traffic.workers);
    request
}

/// Run one coordinated test against the destination behind `peer`.
///
/// Returns `{"source": ..., "destination": ...}`.
pub async fn run_two_node_test(
    peer: &ControlPlaneClient,
    source: &SourceHandler,
    config: &NodeConfig,
) -> Result<Value, CoordinationError> {
    let max_wait = config.control.max_wait();
    info!(peer = peer.base_url(), max_wait_sec = max_wait.as_secs(), "waiting for destination");
    if !peer.wait_for_ready(max_wait).await {
        return Err(CoordinationError::Network(format!(
            "destination {} not ready after {}s",
            peer.base_url(),
            max_wait.as_secs()
        )));
    }

    if !peer.update_config(&config.to_payload()).await? {
        return Err(CoordinationError::Validation(
            "configuration failed validation".into(),
        ));
    }

    let request = start_request(config);
    if !peer.start_test(&request).await? {
        return Err(CoordinationError::Rejected(
            "destination declined to start".into(),
        ));
    }

    let started = match source.start_test(request).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(CoordinationError::Rejected(
            "local traffic generation declined to start".into(),
        )),
        Err(e) => Err(e),
    };
    if let Err(e) = started {
        error!(error = %e, "local start failed, stopping destination");
        if let Err(stop_err) = peer.stop_test().await {
            warn!(error = %stop_err, "failed to stop destination after local failure");
        }
        return Err(e);
    }

    source.wait_for_completion().await;
    // Completes a run cut short by cancellation; empty if it already finished.
    source.stop_test(StopRequest::default()).await?;
    let source_results = source.get_results().await;

    let destination_results = peer.stop_test().await?;
    info!(peer = peer.base_url(), "two-node test finished");

    Ok(json!({
        "source": source_results,
        "destination": destination_results,
    }))
}
