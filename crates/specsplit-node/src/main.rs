//! Specsplit Node - runs either side of a split speculative-decoding link.
//!
//! `serve` runs the target side with a scorer that accepts every proposal;
//! `probe` runs the draft side with synthetic proposals and reports the
//! round-trip latency of each step. Together they smoke-test a deployment's
//! network path without loading any model.

mod loopback;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loopback::{MirrorScorer, SyntheticProposer};
use specsplit_core::{
    CancellationToken, ClientConfig, Device, ExecuteModelRequest, RemoteDraftWorker,
    RemoteTargetWorker, ServerConfig, TransportConfig,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "specsplit-node")]
#[command(about = "Draft/target node for remote speculative decoding")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the target side and score every step it receives
    Serve {
        /// JSON server config; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long)]
        port: Option<u16>,

        /// Device proposals are placed on before scoring
        #[arg(long, default_value = "cpu")]
        device: Device,
    },

    /// Run the draft side against a target and report step latency
    Probe {
        /// JSON client config; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Target host
        #[arg(long)]
        host: Option<String>,

        /// Target port
        #[arg(short, long)]
        port: Option<u16>,

        /// Connection attempts before giving up
        #[arg(long)]
        max_retries: Option<u32>,

        /// Per-operation socket timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Number of decode steps to run
        #[arg(long, default_value = "10")]
        steps: usize,

        /// Sequences per step
        #[arg(long, default_value = "8")]
        batch: usize,

        /// Proposed tokens per sequence
        #[arg(short, long, default_value = "4")]
        k: usize,

        /// Device scores are placed on after arrival
        #[arg(long, default_value = "cpu")]
        device: Device,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            config,
            host,
            port,
            device,
        } => {
            let mut server_config: ServerConfig = load_config(config.as_deref())?;
            if let Some(host) = host {
                server_config.host = host;
            }
            if let Some(port) = port {
                server_config.port = port;
            }
            serve(server_config, device).await
        }
        Command::Probe {
            config,
            host,
            port,
            max_retries,
            timeout_ms,
            steps,
            batch,
            k,
            device,
        } => {
            let mut client_config: ClientConfig = load_config(config.as_deref())?;
            if let Some(host) = host {
                client_config.host = host;
            }
            if let Some(port) = port {
                client_config.port = port;
            }
            if let Some(retries) = max_retries {
                client_config.max_retries = retries;
            }
            if let Some(ms) = timeout_ms {
                client_config.socket_timeout = Some(Duration::from_millis(ms));
            }
            probe(client_config, device, steps, batch, k).await
        }
    }
}

fn load_config<T: serde::de::DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

async fn serve(config: ServerConfig, device: Device) -> Result<()> {
    info!("Starting target node");
    let mut worker = RemoteTargetWorker::bind(MirrorScorer, config, device).await?;

    // Print port for launch scripts to read (intentional stdout)
    println!("NODE_PORT={}", worker.local_addr().port());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown signal received, exiting");
            shutdown.cancel();
        });
    }

    worker.serve(ExecuteModelRequest::default, &shutdown).await?;
    info!(
        "Served {} steps and {} heartbeats",
        worker.steps_completed(),
        worker.heartbeats_answered()
    );
    Ok(())
}

async fn probe(
    config: ClientConfig,
    device: Device,
    steps: usize,
    batch: usize,
    k: usize,
) -> Result<()> {
    info!("Probing target at {}", config.addr());
    let mut worker = RemoteDraftWorker::new(SyntheticProposer::default(), config, device);

    let rtt = worker
        .heartbeat(TransportConfig::DEFAULT_HEARTBEAT_TIMEOUT)
        .await
        .context("Target did not answer heartbeat")?;
    info!("Heartbeat round trip: {:?}", rtt);

    let request = ExecuteModelRequest::new((0..batch as u64).collect(), k);
    let mut latencies = Vec::with_capacity(steps);
    for step in 1..=steps {
        let started = Instant::now();
        let scores = worker
            .execute_model(&request)
            .await
            .with_context(|| format!("Step {} failed", step))?;
        let elapsed = started.elapsed();
        latencies.push(elapsed);
        info!("Step {}/{}: {:?} in {:?}", step, steps, scores, elapsed);
    }

    if let (Some(min), Some(max)) = (latencies.iter().min(), latencies.iter().max()) {
        let total: Duration = latencies.iter().sum();
        info!(
            "{} steps: min {:?}, mean {:?}, max {:?}, reconnects {}",
            latencies.len(),
            min,
            total / latencies.len() as u32,
            max,
            worker.client().reconnects()
        );
    }

    worker.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_defaults_without_path() {
        let config: ClientConfig = load_config(None).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_load_partial_json_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(&path, r#"{"host": "10.0.0.7", "port": 9001, "max_retries": 2}"#).unwrap();

        let config: ClientConfig = load_config(Some(&path)).unwrap();
        assert_eq!(config.addr(), "10.0.0.7:9001");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_backoff, TransportConfig::DEFAULT_RETRY_BACKOFF);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config::<ServerConfig>(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("Invalid config"));
    }

    #[test]
    fn test_probe_args() {
        let args = Args::try_parse_from([
            "specsplit-node",
            "probe",
            "--port",
            "9000",
            "-k",
            "2",
            "--device",
            "npu:1",
        ])
        .unwrap();

        match args.command {
            Command::Probe {
                port, k, device, steps, ..
            } => {
                assert_eq!(port, Some(9000));
                assert_eq!(k, 2);
                assert_eq!(device, Device::Npu(1));
                assert_eq!(steps, 10);
            }
            other => panic!("Expected probe, got: {:?}", other),
        }
    }
}
