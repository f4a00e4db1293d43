//! Control-plane HTTP server.
//!
//! Serves the fixed endpoint set and dispatches to the attached [`Handler`].
//! `health` answers without a handler; every other endpoint returns 503 until
//! one is attached. Failures are always JSON [`ErrorResponse`] bodies, and a
//! panicking handler yields a 500 rather than taking the process down.

use std::any::Any;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::handler::Handler;
use super::messages::{
    AckResponse, ErrorResponse, HealthResponse, StartRequest, StopRequest, StopResponse,
};
use super::{CONFIG, HEALTH, METRICS, RESULTS, START_TEST, STATUS, STOP_TEST};
use crate::error::CoordinationError;

/// Request bodies above this many bytes are rejected with 413.
pub const MAX_BODY_BYTES: usize = 1_000_000;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Shared router state: the handler slot.
#[derive(Clone, Default)]
pub struct ControlState {
    handler: Arc<RwLock<Option<Arc<dyn Handler>>>>,
}

impl ControlState {
    pub async fn attach(&self, handler: Arc<dyn Handler>) {
        info!(role = %handler.role(), "handler attached to control plane");
        *self.handler.write().await = Some(handler);
    }

    /// The attached handler, or `NotReady`.
    pub async fn handler(&self) -> Result<Arc<dyn Handler>, CoordinationError> {
        self.handler
            .read()
            .await
            .clone()
            .ok_or(CoordinationError::NotReady)
    }
}

// ---------------------------------------------------------------------------
// Body extractor
// ---------------------------------------------------------------------------

/// A JSON request body. An empty body decodes as `{}`.
pub struct JsonBody(pub Value);

impl<S> FromRequest<S> for JsonBody
where
    S: Send + Sync,
{
    type Rejection = CoordinationError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                CoordinationError::PayloadTooLarge
            } else {
                CoordinationError::Validation(rejection.body_text())
            }
        })?;

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(JsonBody(Value::Object(Default::default())));
        }
        let text = std::str::from_utf8(&bytes).map_err(|_| {
            CoordinationError::Validation("request body is not valid UTF-8".into())
        })?;
        let value = serde_json::from_str(text)
            .map_err(|e| CoordinationError::Validation(format!("invalid JSON: {e}")))?;
        Ok(JsonBody(value))
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

async fn status(State(state): State<ControlState>) -> Result<Response, CoordinationError> {
    let handler = state.handler().await?;
    Ok(Json(handler.get_status().await).into_response())
}

async fn get_config(State(state): State<ControlState>) -> Result<Response, CoordinationError> {
    let handler = state.handler().await?;
    Ok(Json(handler.get_config().await).into_response())
}

async fn update_config(
    State(state): State<ControlState>,
    body: Result<JsonBody, CoordinationError>,
) -> Result<Response, CoordinationError> {
    let handler = state.handler().await?;
    let Value::Object(payload) = body?.0 else {
        return Err(CoordinationError::Validation(
            "configuration must be a JSON object".into(),
        ));
    };
    if handler.update_config(payload).await? {
        Ok(Json(AckResponse::new("config updated")).into_response())
    } else {
        Err(CoordinationError::Rejected("failed to update config".into()))
    }
}

async fn start_test(
    State(state): State<ControlState>,
    body: Result<JsonBody, CoordinationError>,
) -> Result<Response, CoordinationError> {
    let handler = state.handler().await?;
    let request = StartRequest::from_value(body?.0)?;
    debug!(duration = request.duration, packet_rate = request.packet_rate, "start_test received");
    if handler.start_test(request).await? {
        Ok(Json(AckResponse::new("test started")).into_response())
    } else {
        Err(CoordinationError::Rejected("failed to start test".into()))
    }
}

async fn stop_test(
    State(state): State<ControlState>,
    body: Result<JsonBody, CoordinationError>,
) -> Result<Response, CoordinationError> {
    let handler = state.handler().await?;
    body?;
    let results = handler.stop_test(StopRequest::default()).await?;
    Ok(Json(StopResponse {
        status: "test stopped".to_string(),
        results,
    })
    .into_response())
}

async fn results(State(state): State<ControlState>) -> Result<Response, CoordinationError> {
    let handler = state.handler().await?;
    Ok(Json(handler.get_results().await).into_response())
}

async fn metrics(State(state): State<ControlState>) -> Result<Response, CoordinationError> {
    let handler = state.handler().await?;
    Ok(Json(handler.get_metrics().await).into_response())
}

async fn not_found() -> Response {
    let status = StatusCode::NOT_FOUND;
    (status, Json(ErrorResponse::new(status, "not found"))).into_response()
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "control-plane handler panicked");
    let status = StatusCode::INTERNAL_SERVER_ERROR;
    (status, Json(ErrorResponse::new(status, "internal server error"))).into_response()
}

/// Build the control-plane router over `state`.
pub fn router(state: ControlState, max_body_bytes: usize) -> Router {
    Router::new()
        .route(HEALTH, get(health))
        .route(STATUS, get(status))
        .route(CONFIG, get(get_config).post(update_config))
        .route(START_TEST, post(start_test))
        .route(STOP_TEST, post(stop_test))
        .route(RESULTS, get(results))
        .route(METRICS, get(metrics))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// ControlPlaneServer
// ---------------------------------------------------------------------------

pub struct ControlPlaneServer {
    state: ControlState,
    shutdown: CancellationToken,
    max_body_bytes: usize,
}

impl ControlPlaneServer {
    /// Create a server that stops accepting connections when `shutdown`
    /// fires.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            state: ControlState::default(),
            shutdown,
            max_body_bytes: MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn state(&self) -> ControlState {
        self.state.clone()
    }

    pub async fn attach(&self, handler: Arc<dyn Handler>) {
        self.state.attach(handler).await;
    }

    pub fn router(&self) -> Router {
        router(self.state.clone(), self.max_body_bytes)
    }

    /// Serve on `listener` until the shutdown token fires.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "control plane listening");
        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!(%addr, "control plane stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
