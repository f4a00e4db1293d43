//! xdpbench -- two-node UDP load generation for benchmarking packet
//! processing.
//!
//! A source node generates paced UDP traffic with a multi-worker
//! [`traffic::TrafficEngine`]; a destination node runs the program under
//! test. The nodes coordinate over a small HTTP/JSON [`control`] plane.

pub mod config;
pub mod control;
pub mod error;
pub mod orchestrate;
pub mod roles;
pub mod traffic;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

pub use config::NodeConfig;
pub use error::{ConfigurationError, CoordinationError};
pub use roles::Role;

/// Run a node: control-plane server plus the handler for `role`, until
/// `shutdown` fires.
pub async fn serve(
    role: Role,
    bind: &str,
    config: NodeConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address: {bind}"))?;

    let server = control::ControlPlaneServer::new(shutdown.clone())
        .with_max_body_bytes(config.control.max_body_bytes);
    let handler = roles::build_handler(role, config, shutdown.clone());
    server.attach(handler).await;

    tracing::info!(%role, %addr, "xdpbench node starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    server.serve(listener).await?;

    Ok(())
}
