use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use xdpbench::config::{BasicValidator, ConfigValidator, LoggingConfig, NodeConfig};
use xdpbench::control::ControlPlaneClient;
use xdpbench::roles::SourceHandler;
use xdpbench::traffic::TrafficEngine;
use xdpbench::{orchestrate, Role};

#[derive(Parser)]
#[command(
    name = "xdpbench",
    about = "Two-node UDP load generator for benchmarking XDP/eBPF packet processing",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConfigArgs {
    /// Configuration file (defaults to $XDPBENCH_CONFIG, then /etc/xdpbench/xdpbench.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Named preset from the configuration to apply
    #[arg(long)]
    preset: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node: control-plane server plus the handler for its role
    Serve {
        /// Node role: source or destination
        #[arg(long)]
        role: Role,

        /// Bind address (defaults to network.control_bind)
        #[arg(long)]
        bind: Option<String>,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Generate traffic locally without coordination and print statistics
    Generate {
        #[command(flatten)]
        config: ConfigArgs,

        /// Aggregate packets per second
        #[arg(long)]
        rate: Option<u64>,

        /// Test duration in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Destination address
        #[arg(long)]
        target: Option<String>,

        /// Number of concurrent workers
        #[arg(long)]
        workers: Option<u32>,
    },

    /// Run a coordinated test against a destination node
    Run {
        /// Destination control plane, host:port
        #[arg(long)]
        peer: String,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Validate a configuration file and exit
    Check {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn load_config(args: &ConfigArgs) -> Result<NodeConfig> {
    let config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::load_or_default(),
    };
    match &args.preset {
        Some(name) => Ok(config.with_preset(name)?),
        None => Ok(config),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Root cancellation token, cancelled on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            trigger.cancel();
        }
    });
    token
}

fn parse_peer(peer: &str) -> Result<(String, u16)> {
    let (host, port) = peer
        .rsplit_once(':')
        .with_context(|| format!("peer must be host:port, got '{peer}'"))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid peer port '{port}'"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Raw configuration document for validation: the file as written, or the
/// compiled-in defaults.
fn raw_config(path: Option<&Path>) -> Result<serde_json::Value> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let value: toml::Value = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;
            Ok(serde_json::to_value(value)?)
        }
        None => Ok(serde_json::to_value(NodeConfig::default())?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { role, bind, config } => {
            let config = load_config(&config)?;
            init_tracing(&config.logging);
            let bind = bind.unwrap_or_else(|| config.network.control_bind.clone());
            tracing::info!(%role, %bind, "Starting xdpbench node");
            xdpbench::serve(role, &bind, config, shutdown_on_ctrl_c()).await?;
        }
        Commands::Generate {
            config,
            rate,
            duration,
            target,
            workers,
        } => {
            let mut config = load_config(&config)?;
            init_tracing(&config.logging);
            if let Some(rate) = rate {
                config.traffic.packet_rate = rate;
            }
            if let Some(duration) = duration {
                config.test.duration = duration;
            }
            if let Some(target) = target {
                config.network.dst_address = target;
            }
            if let Some(workers) = workers {
                config.traffic.workers = workers;
            }

            let engine = TrafficEngine::new(config.traffic_config()?, shutdown_on_ctrl_c())?
                .with_join_timeout(config.control.join_timeout());
            let ok = engine.start().await;
            let report = engine.report();
            tracing::info!(summary = %report.summary_line(), "Traffic generation finished");
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !ok {
                bail!("traffic generation failed");
            }
        }
        Commands::Run { peer, config } => {
            let config = load_config(&config)?;
            init_tracing(&config.logging);
            let (host, port) = parse_peer(&peer)?;
            let client = ControlPlaneClient::new(&host, port, config.control.request_timeout())?
                .with_poll_interval(config.control.health_poll_interval());
            let source = SourceHandler::new(config.clone(), shutdown_on_ctrl_c());

            tracing::info!(%peer, "Running coordinated test");
            let results = orchestrate::run_two_node_test(&client, &source, &config).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Check { config: args } => {
            init_tracing(&LoggingConfig {
                level: "warn".into(),
                ..Default::default()
            });
            let raw = raw_config(args.config.as_deref())?;
            let report = BasicValidator.validate(&raw);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                bail!("configuration is invalid ({} errors)", report.errors.len());
            }
            let config = load_config(&args)?;
            config.traffic_config()?;
            println!("Configuration OK.");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        assert_eq!(parse_peer("10.0.0.2:8080").unwrap(), ("10.0.0.2".to_string(), 8080));
        assert_eq!(parse_peer("[::1]:9000").unwrap(), ("::1".to_string(), 9000));
        assert!(parse_peer("nohost").is_err());
        assert!(parse_peer("host:http").is_err());
    }
}
