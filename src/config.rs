//! TOML configuration for an xdpbench node.
//!
//! Layered model: compiled-in defaults, an optional file (path from
//! `XDPBENCH_CONFIG` or `/etc/xdpbench/xdpbench.toml`), named presets merged
//! on top, and finally per-test overrides carried by a start request.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::control::messages::StartRequest;
use crate::error::ConfigurationError;
use crate::roles::measurement::MeasurementMode;
use crate::traffic::{resolve_target, TrafficConfig, MAX_PACKET_SIZE, MAX_WORKERS};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "XDPBENCH_CONFIG";

/// System-wide config file, used when [`CONFIG_ENV`] is unset or unusable.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/xdpbench/xdpbench.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for one node process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub traffic: TrafficSettings,
    #[serde(default)]
    pub test: TestSettings,
    #[serde(default)]
    pub control: ControlSettings,
    #[serde(default)]
    pub measurement: MeasurementSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named partial configurations, merged on request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub presets: BTreeMap<String, Value>,
}

impl NodeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded node configuration");
        Ok(config)
    }

    /// First loadable file among `$XDPBENCH_CONFIG` and
    /// `/etc/xdpbench/xdpbench.toml`, else the compiled-in defaults.
    pub fn load_or_default() -> Self {
        let mut candidates: Vec<PathBuf> = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .into_iter()
            .collect();
        let system = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system.exists() {
            candidates.push(system);
        }
        Self::load_first(&candidates).unwrap_or_else(|| {
            debug!("no usable config file, using compiled-in defaults");
            Self::default()
        })
    }

    /// Load the first of `candidates` that reads and parses; broken files
    /// are logged and skipped.
    fn load_first(candidates: &[PathBuf]) -> Option<Self> {
        candidates.iter().find_map(|path| {
            Self::load(path)
                .map_err(|e| warn!(path = %path.display(), error = %e, "skipping config file"))
                .ok()
        })
    }

    /// The configuration as a JSON object, as served by the `config` endpoint.
    pub fn to_payload(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Deep-merge `overlay` into this configuration.
    pub fn merged_with(&self, overlay: &Value) -> Result<Self, ConfigurationError> {
        let mut base = serde_json::to_value(self)
            .map_err(|e| ConfigurationError::Malformed(e.to_string()))?;
        deep_merge(&mut base, overlay);
        serde_json::from_value(base).map_err(|e| ConfigurationError::Malformed(e.to_string()))
    }

    /// Merge the named preset on top of this configuration.
    pub fn with_preset(&self, name: &str) -> Result<Self, ConfigurationError> {
        let preset = self
            .presets
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownPreset(name.to_string()))?;
        let merged = self.merged_with(preset)?;
        info!(preset = name, "applied configuration preset");
        Ok(merged)
    }

    /// Apply the per-test overrides of a start request.
    pub fn with_overrides(&self, req: &StartRequest) -> Result<Self, ConfigurationError> {
        let mut cfg = self.clone();
        cfg.test.duration = whole_number("duration", req.duration)?;
        cfg.traffic.packet_rate = whole_number("packet_rate", req.packet_rate)?;
        if let Some(size) = req.packet_size {
            cfg.traffic.packet_size = size;
        }
        if let Some(flows) = req.flows {
            cfg.traffic.flows = flows;
        }
        if let Some(workers) = req.workers {
            cfg.traffic.workers = workers;
        }
        if let Some(target) = &req.target {
            cfg.network.dst_address = target.clone();
        }
        if let Some(ports) = &req.ports {
            cfg.network.traffic_ports = ports.clone();
        }
        if let Some(mode) = req.mode {
            cfg.test.mode = mode;
        }
        Ok(cfg)
    }

    /// Build and range-check the traffic configuration of a source node.
    pub fn traffic_config(&self) -> Result<TrafficConfig, ConfigurationError> {
        let config = TrafficConfig {
            target: resolve_target(&self.network.dst_address)?,
            ports: self.network.traffic_ports.clone(),
            packet_rate: self.traffic.packet_rate,
            packet_size: self.traffic.packet_size,
            flows: self.traffic.flows,
            workers: self.traffic.workers,
            duration_secs: self.test.duration,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Convert a positive JSON number to an integer without rounding.
fn whole_number(field: &'static str, value: f64) -> Result<u64, ConfigurationError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(match field {
            "duration" => ConfigurationError::InvalidDuration,
            _ => ConfigurationError::InvalidRate,
        });
    }
    if value.fract() != 0.0 {
        return Err(ConfigurationError::NonIntegral { field, value });
    }
    // 2^64 and above do not fit.
    if value >= u64::MAX as f64 {
        return Err(ConfigurationError::OutOfRange { field, value });
    }
    Ok(value as u64)
}

/// Recursively merge `overlay` into `base`: objects merge key by key,
/// anything else replaces.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address and port the control-plane server binds.
    pub control_bind: String,
    /// Control-plane address of the peer node.
    pub peer_address: String,
    pub peer_control_port: u16,
    /// Destination of generated traffic (the node under test).
    pub dst_address: String,
    /// UDP ports flows are spread across.
    pub traffic_ports: Vec<u16>,
    /// Interface the fast-path program attaches to on the destination.
    pub interface: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            control_bind: "0.0.0.0:8080".to_string(),
            peer_address: "127.0.0.1".to_string(),
            peer_control_port: 8080,
            dst_address: "127.0.0.1".to_string(),
            traffic_ports: vec![9000, 9001, 9002, 9003],
            interface: "eth0".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Traffic / test
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficSettings {
    /// Aggregate packets per second.
    pub packet_rate: u64,
    pub packet_size: u32,
    pub flows: u32,
    pub workers: u32,
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            packet_rate: 1000,
            packet_size: 64,
            flows: 4,
            workers: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Test duration in seconds.
    pub duration: u64,
    /// What the destination measures.
    pub mode: MeasurementMode,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            duration: 10,
            mode: MeasurementMode::Xdp,
        }
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    /// Timeout applied to every remote call.
    pub request_timeout_sec: u64,
    /// Delay between health polls while waiting for a peer.
    pub health_poll_interval_ms: u64,
    /// Total budget for a peer to become healthy.
    pub max_wait_sec: u64,
    /// Bound on waiting for workers after a stop request.
    pub join_timeout_sec: u64,
    /// Request bodies above this size are rejected with 413.
    pub max_body_bytes: usize,
}

impl ControlSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_sec)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_sec)
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            request_timeout_sec: 30,
            health_poll_interval_ms: 2000,
            max_wait_sec: 60,
            join_timeout_sec: 10,
            max_body_bytes: 1_000_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

/// External fast-path loader used by the destination role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSettings {
    /// Loader binary: `<loader> <interface> <program> --mode <attach_mode>`.
    pub loader_path: String,
    pub program_path: String,
    /// Attach mode passed to the loader (`native`, `skb`, `offload`).
    pub attach_mode: String,
    /// Userspace baseline binary: `<baseline> <interface>`.
    pub baseline_path: String,
    /// JSON counters file the loader keeps up to date.
    pub stats_path: String,
    /// How long a freshly spawned loader must survive to count as loaded.
    pub startup_grace_ms: u64,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            loader_path: "/usr/local/bin/xdp_loader".to_string(),
            program_path: "/usr/local/lib/xdpbench/xdp_preproc.o".to_string(),
            attach_mode: "native".to_string(),
            baseline_path: "/usr/local/bin/baseline_app".to_string(),
            stats_path: "/run/xdpbench/stats.json".to_string(),
            startup_grace_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Outcome of validating a raw configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn new() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.valid = false;
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Validates a raw configuration document before it is deserialized.
pub trait ConfigValidator: Send + Sync {
    fn validate(&self, raw: &Value) -> ValidationReport;
}

/// Structural and range checks for an xdpbench configuration.
#[derive(Debug, Default)]
pub struct BasicValidator;

const KNOWN_SECTIONS: &[&str] = &[
    "network",
    "traffic",
    "test",
    "control",
    "measurement",
    "logging",
    "presets",
];

impl BasicValidator {
    fn check_u64(
        report: &mut ValidationReport,
        section: &Map<String, Value>,
        path: &str,
        key: &str,
        range: std::ops::RangeInclusive<u64>,
    ) -> Option<u64> {
        let value = section.get(key)?;
        match value.as_u64() {
            Some(n) if range.contains(&n) => Some(n),
            Some(n) => {
                report.error(format!(
                    "{path}.{key} must be between {} and {}, got {n}",
                    range.start(),
                    range.end()
                ));
                None
            }
            None => {
                report.error(format!("{path}.{key} must be a non-negative integer"));
                None
            }
        }
    }
}

impl ConfigValidator for BasicValidator {
    fn validate(&self, raw: &Value) -> ValidationReport {
        let mut report = ValidationReport::new();

        let Some(root) = raw.as_object() else {
            report.error("configuration must be a table");
            return report;
        };

        for key in root.keys() {
            if !KNOWN_SECTIONS.contains(&key.as_str()) {
                report.warning(format!("unknown section '{key}' will be ignored"));
            }
        }

        for (name, section) in root {
            if name != "presets" && KNOWN_SECTIONS.contains(&name.as_str()) && !section.is_object() {
                report.error(format!("section '{name}' must be a table"));
            }
        }

        if let Some(traffic) = root.get("traffic").and_then(Value::as_object) {
            if let Some(rate) = Self::check_u64(&mut report, traffic, "traffic", "packet_rate", 1..=u64::MAX) {
                if rate > 1_000_000 {
                    report.warning(format!(
                        "traffic.packet_rate {rate} pps is unlikely to be sustained by a userspace sender"
                    ));
                }
            }
            if let Some(size) = Self::check_u64(
                &mut report,
                traffic,
                "traffic",
                "packet_size",
                1..=u64::from(MAX_PACKET_SIZE),
            ) {
                if size > 1500 {
                    report.warning(format!(
                        "traffic.packet_size {size} exceeds a standard 1500-byte MTU"
                    ));
                }
            }
            Self::check_u64(&mut report, traffic, "traffic", "flows", 1..=u64::from(u32::MAX));
            if let Some(workers) =
                Self::check_u64(&mut report, traffic, "traffic", "workers", 1..=u64::from(MAX_WORKERS))
            {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get() as u64)
                    .unwrap_or(1);
                if workers > cores {
                    report.warning(format!(
                        "traffic.workers {workers} exceeds the {cores} available cores"
                    ));
                }
            }
        }

        if let Some(test) = root.get("test").and_then(Value::as_object) {
            Self::check_u64(&mut report, test, "test", "duration", 1..=u64::MAX);
            if let Some(mode) = test.get("mode") {
                if serde_json::from_value::<MeasurementMode>(mode.clone()).is_err() {
                    report.error(format!("test.mode must be 'xdp' or 'baseline', got {mode}"));
                }
            }
        }

        if let Some(network) = root.get("network").and_then(Value::as_object) {
            if let Some(ports) = network.get("traffic_ports") {
                match ports.as_array() {
                    Some(list) if list.is_empty() => {
                        report.error("network.traffic_ports cannot be empty")
                    }
                    Some(list) => {
                        for port in list {
                            match port.as_u64() {
                                Some(p) if (1..=65535).contains(&p) => {}
                                _ => report.error(format!(
                                    "network.traffic_ports entry {port} is not a valid port"
                                )),
                            }
                        }
                    }
                    None => report.error("network.traffic_ports must be a list"),
                }
            }
            if let Some(dst) = network.get("dst_address") {
                if dst.as_str().map(str::trim).map_or(true, str::is_empty) {
                    report.error("network.dst_address cannot be empty");
                }
            }
        }

        if let Some(presets) = root.get("presets") {
            match presets.as_object() {
                Some(map) => {
                    for (name, preset) in map {
                        if !preset.is_object() {
                            report.error(format!("preset '{name}' must be a table"));
                        }
                    }
                }
                None => report.error("presets must be a table of tables"),
            }
        }

        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[network]
dst_address = "10.0.0.2"
traffic_ports = [7000]

[traffic]
packet_rate = 5000
workers = 4

[presets.stress]
traffic = {{ packet_rate = 100000 }}
"#
        )
        .unwrap();

        let cfg = NodeConfig::load(file.path()).unwrap();
        assert_eq!(cfg.network.dst_address, "10.0.0.2");
        assert_eq!(cfg.network.traffic_ports, vec![7000]);
        assert_eq!(cfg.network.control_bind, "0.0.0.0:8080");
        assert_eq!(cfg.traffic.packet_rate, 5000);
        assert_eq!(cfg.traffic.packet_size, 64);
        assert_eq!(cfg.test.duration, 10);

        let stressed = cfg.with_preset("stress").unwrap();
        assert_eq!(stressed.traffic.packet_rate, 100_000);
        assert_eq!(stressed.traffic.workers, 4);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(NodeConfig::load(Path::new("/nonexistent/xdpbench.toml")).is_err());
    }

    #[test]
    fn test_load_first_skips_broken_files() {
        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "[traffic\npacket_rate = ").unwrap();
        let mut good = tempfile::NamedTempFile::new().unwrap();
        writeln!(good, "[traffic]\npacket_rate = 4242").unwrap();

        let candidates = vec![
            PathBuf::from("/nonexistent/xdpbench.toml"),
            broken.path().to_path_buf(),
            good.path().to_path_buf(),
        ];
        let cfg = NodeConfig::load_first(&candidates).unwrap();
        assert_eq!(cfg.traffic.packet_rate, 4242);

        assert!(NodeConfig::load_first(&candidates[..2]).is_none());
    }

    #[test]
    fn test_unknown_preset() {
        assert_eq!(
            NodeConfig::default().with_preset("nope"),
            Err(ConfigurationError::UnknownPreset("nope".into()))
        );
    }

    #[test]
    fn test_deep_merge_nested() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        deep_merge(&mut base, &json!({"a": {"b": 10}, "e": 4}));
        assert_eq!(base, json!({"a": {"b": 10, "c": 2}, "d": 3, "e": 4}));
    }

    #[test]
    fn test_merged_with_rejects_wrong_types() {
        let result = NodeConfig::default().merged_with(&json!({"traffic": {"packet_rate": "fast"}}));
        assert!(matches!(result, Err(ConfigurationError::Malformed(_))));
    }

    #[test]
    fn test_overrides_apply_and_stay_integral() {
        let mut req = StartRequest::new(3.0, 2500.0);
        req.workers = Some(5);
        req.ports = Some(vec![1234]);
        let cfg = NodeConfig::default().with_overrides(&req).unwrap();
        assert_eq!(cfg.test.duration, 3);
        assert_eq!(cfg.traffic.packet_rate, 2500);
        assert_eq!(cfg.traffic.workers, 5);
        assert_eq!(cfg.network.traffic_ports, vec![1234]);

        let fractional = StartRequest::new(1.5, 100.0);
        assert!(matches!(
            NodeConfig::default().with_overrides(&fractional),
            Err(ConfigurationError::NonIntegral { field: "duration", .. })
        ));
    }

    #[test]
    fn test_oversized_override_is_out_of_range() {
        let huge = StartRequest::new(1.0, 1e20);
        assert!(matches!(
            NodeConfig::default().with_overrides(&huge),
            Err(ConfigurationError::OutOfRange { field: "packet_rate", .. })
        ));
        assert_eq!(whole_number("duration", 1e19), Ok(10_000_000_000_000_000_000));
    }

    #[test]
    fn test_traffic_config_range_checks() {
        let mut cfg = NodeConfig::default();
        assert!(cfg.traffic_config().is_ok());

        cfg.traffic.workers = 65;
        assert_eq!(
            cfg.traffic_config(),
            Err(ConfigurationError::InvalidWorkerCount(65))
        );

        cfg.traffic.workers = 2;
        cfg.network.dst_address = String::new();
        assert_eq!(cfg.traffic_config(), Err(ConfigurationError::EmptyTarget));
    }

    #[test]
    fn test_validator_accepts_defaults() {
        let raw = serde_json::to_value(NodeConfig::default()).unwrap();
        let report = BasicValidator.validate(&raw);
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_validator_collects_errors_and_warnings() {
        let raw = json!({
            "traffic": {"packet_rate": 0, "packet_size": 9001, "workers": 100},
            "network": {"traffic_ports": []},
            "test": {"mode": "dpdk"},
            "extras": {}
        });
        let report = BasicValidator.validate(&raw);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 5, "{:?}", report.errors);
        assert!(report.warnings.iter().any(|w| w.contains("extras")));
    }

    #[test]
    fn test_validator_rejects_non_table() {
        let report = BasicValidator.validate(&json!([1, 2]));
        assert!(!report.valid);
    }
}
