//! Control plane -- the HTTP/JSON protocol two nodes use to coordinate a test.
//!
//! Every node serves the same endpoint set through [`server::ControlPlaneServer`],
//! backed by a role-specific [`handler::Handler`]. The orchestrating side
//! drives its peer with [`client::ControlPlaneClient`].

pub mod client;
pub mod handler;
pub mod messages;
pub mod server;

pub use client::ControlPlaneClient;
pub use handler::Handler;
pub use server::ControlPlaneServer;

// ---- Endpoints ----

pub const HEALTH: &str = "/health";
pub const STATUS: &str = "/status";
pub const CONFIG: &str = "/config";
pub const START_TEST: &str = "/start_test";
pub const STOP_TEST: &str = "/stop_test";
pub const RESULTS: &str = "/results";
pub const METRICS: &str = "/metrics";
