//! gatekeeper - multi-stream EWMA anomaly ingest server
//!
//! Usage:
//!   gatekeeper --config gatekeeper.json
//!   gatekeeper --addr 127.0.0.1:3000 --shards 4 --alpha 0.2 --k 2.5

use std::path::PathBuf;
use std::thread;

use clap::Parser;
use crossbeam_channel::Receiver;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ewma_stream::config::AppConfig;
use ewma_stream::error::ServiceError;
use ewma_stream::gatekeeper::{AnomalyReport, Gatekeeper};

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(about = "Per-stream EWMA anomaly detection over HTTP")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(long)]
    addr: Option<String>,

    /// Shard worker count (overrides config)
    #[arg(long)]
    shards: Option<usize>,

    /// Smoothing factor (overrides config)
    #[arg(long)]
    alpha: Option<f64>,

    /// Threshold multiplier (overrides config)
    #[arg(long)]
    k: Option<f64>,

    /// Warm-up samples per stream (overrides config)
    #[arg(long)]
    warmup: Option<u32>,

    /// Pending anomaly reports before new ones are dropped
    #[arg(long, default_value = "200000")]
    sink_capacity: usize,
}

impl Args {
    fn into_config(self) -> Result<(AppConfig, usize), ServiceError> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        if let Some(addr) = self.addr {
            config.server.listen_addr = addr;
        }
        if let Some(shards) = self.shards {
            config.server.shards = shards;
        }
        if let Some(alpha) = self.alpha {
            config.detector.alpha = alpha;
        }
        if let Some(k) = self.k {
            config.detector.k = k;
        }
        if let Some(warmup) = self.warmup {
            config.detector.warmup_count = warmup;
        }
        config.validate()?;
        Ok((config, self.sink_capacity))
    }
}

/// Drains anomaly reports into the log.
fn spawn_alert_sink(rx: Receiver<AnomalyReport>) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("ewma-alerts".into())
        .spawn(move || {
            while let Ok(report) = rx.recv() {
                warn!(
                    stream = %report.stream,
                    shard = report.shard,
                    value = report.value,
                    mean = report.verdict.mean,
                    threshold = report.verdict.threshold,
                    deviation = report.verdict.deviation,
                    timestamp = report.timestamp,
                    "ANOMALY"
                );
            }
            info!("Alert sink stopped.");
        })
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config, sink_capacity) = Args::parse().into_config()?;

    info!("Initializing EWMA gatekeeper");

    let (gatekeeper, anomalies) = Gatekeeper::spawn(&config, sink_capacity)?;
    let sink_handle = spawn_alert_sink(anomalies)?;

    let app = gatekeeper.router();
    let listener = TcpListener::bind(&config.server.listen_addr).await?;

    info!(addr = %config.server.listen_addr, "Gatekeeper listening.");
    info!("  POST /ingest       - Single sample");
    info!("  POST /ingest/batch - Batch of samples");
    info!("  GET  /metrics      - Prometheus metrics");
    info!("  GET  /health       - Health check");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
            info!("Shutting down... (Waiting for queues to drain)");
        })
        .await?;

    gatekeeper.shutdown();

    if sink_handle.join().is_err() {
        warn!("Alert sink panicked");
    }
    info!("Goodbye.");
    Ok(())
}
