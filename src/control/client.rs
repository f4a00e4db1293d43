//! Control-plane HTTP client used by the orchestrating node to drive its peer.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::messages::{
    AckResponse, ConfigPayload, ErrorResponse, HealthResponse, MetricsResponse, ResultsPayload,
    StartRequest, StatusResponse, StopRequest, StopResponse,
};
use super::{CONFIG, HEALTH, METRICS, RESULTS, START_TEST, STATUS, STOP_TEST};
use crate::config::{BasicValidator, ConfigValidator};
use crate::error::CoordinationError;

/// Default timeout for every remote call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay between health polls in [`ControlPlaneClient::wait_for_ready`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn map_transport(e: reqwest::Error) -> CoordinationError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        CoordinationError::Network(e.to_string())
    } else {
        CoordinationError::Protocol(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
    poll_interval: Duration,
}

impl ControlPlaneClient {
    /// Client for the peer control plane at `host:port`.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, CoordinationError> {
        if host.contains(':') {
            Self::from_base_url(format!("http://[{host}]:{port}"), timeout)
        } else {
            Self::from_base_url(format!("http://{host}:{port}"), timeout)
        }
    }

    pub fn from_base_url(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CoordinationError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoordinationError::Protocol(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ---- Transport ----

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CoordinationError> {
        self.get_within(path, self.timeout).await
    }

    /// GET with a per-request timeout in place of the client-wide one.
    async fn get_within<T: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<T, CoordinationError> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(map_transport)?;
        Self::decode(resp).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CoordinationError> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(map_transport)?;
        Self::decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, CoordinationError> {
        let status = resp.status();
        let text = resp.text().await.map_err(map_transport)?;
        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.error)
                .unwrap_or(text);
            return Err(CoordinationError::Api {
                status: status.as_u16(),
                message,
            });
        }
        serde_json::from_str(&text).map_err(|e| CoordinationError::Api {
            status: status.as_u16(),
            message: format!("unparsable response body: {e}"),
        })
    }

    // ---- Operations ----

    pub async fn check_health(&self) -> Result<HealthResponse, CoordinationError> {
        self.get(HEALTH).await
    }

    pub async fn get_status(&self) -> Result<StatusResponse, CoordinationError> {
        self.get(STATUS).await
    }

    pub async fn get_config(&self) -> Result<ConfigPayload, CoordinationError> {
        self.get(CONFIG).await
    }

    /// Push configuration to the peer. A configuration that fails local
    /// validation is not sent and yields `Ok(false)`.
    pub async fn update_config(&self, config: &ConfigPayload) -> Result<bool, CoordinationError> {
        let report = BasicValidator.validate(&Value::Object(config.clone()));
        if !report.valid {
            warn!(errors = ?report.errors, "configuration failed validation, not sent");
            return Ok(false);
        }
        let _: AckResponse = self.post(CONFIG, config).await?;
        info!(peer = %self.base_url, "configuration pushed");
        Ok(true)
    }

    /// Start a test on the peer. An invalid request is not sent and yields
    /// `Ok(false)`.
    pub async fn start_test(&self, request: &StartRequest) -> Result<bool, CoordinationError> {
        if let Err(e) = request.validate() {
            warn!(error = %e, "start request failed validation, not sent");
            return Ok(false);
        }
        let _: AckResponse = self.post(START_TEST, request).await?;
        info!(
            peer = %self.base_url,
            duration = request.duration,
            packet_rate = request.packet_rate,
            "test started on peer"
        );
        Ok(true)
    }

    pub async fn stop_test(&self) -> Result<ResultsPayload, CoordinationError> {
        let resp: StopResponse = self.post(STOP_TEST, &StopRequest::default()).await?;
        info!(peer = %self.base_url, "test stopped on peer");
        Ok(resp.results)
    }

    pub async fn get_results(&self) -> Result<ResultsPayload, CoordinationError> {
        self.get(RESULTS).await
    }

    pub async fn get_metrics(&self) -> Result<MetricsResponse, CoordinationError> {
        self.get(METRICS).await
    }

    /// Poll `health` until the peer answers healthy or `max_wait` elapses.
    ///
    /// Every failure while polling is treated as transient. No single poll
    /// outlives the remaining budget.
    pub async fn wait_for_ready(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let poll = self
                .get_within::<HealthResponse>(HEALTH, remaining.min(self.timeout))
                .await;
            match poll {
                Ok(health) if health.status == "healthy" => {
                    info!(
                        peer = %self.base_url,
                        hostname = %health.machine_info.hostname,
                        attempts,
                        "peer is ready"
                    );
                    return true;
                }
                Ok(health) => {
                    debug!(peer = %self.base_url, status = %health.status, "peer not healthy yet")
                }
                Err(e) => debug!(peer = %self.base_url, error = %e, "peer not reachable yet"),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
        warn!(
            peer = %self.base_url,
            attempts,
            max_wait_sec = max_wait.as_secs_f64(),
            "peer did not become ready"
        );
        false
    }
}
