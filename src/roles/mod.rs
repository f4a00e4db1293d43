//! Node roles: the [`Handler`] implementations behind the control plane.
//!
//! - [`source::SourceHandler`] drives a [`crate::traffic::TrafficEngine`].
//! - [`destination::DestinationHandler`] drives a measurement collaborator.

pub mod destination;
pub mod measurement;
pub mod source;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::control::Handler;

pub use destination::DestinationHandler;
pub use measurement::{MeasurementCollaborator, MeasurementCounters, MeasurementMode};
pub use source::SourceHandler;

/// Which side of a two-node test a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Generates traffic.
    Source,
    /// Runs the program under test.
    Destination,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Destination => f.write_str("destination"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "source" | "src" => Ok(Role::Source),
            "destination" | "dst" => Ok(Role::Destination),
            other => Err(format!("unknown role '{other}' (expected source or destination)")),
        }
    }
}

/// Build the handler for `role`. The destination role measures through an
/// external loader process.
pub fn build_handler(
    role: Role,
    config: NodeConfig,
    cancel: CancellationToken,
) -> Arc<dyn Handler> {
    match role {
        Role::Source => Arc::new(SourceHandler::new(config, cancel)),
        Role::Destination => {
            let collaborator = Arc::new(measurement::ProcessCollaborator::from_config(&config));
            Arc::new(DestinationHandler::new(config, collaborator, cancel))
        }
    }
}
