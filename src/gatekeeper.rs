//! Gatekeeper: multi-stream ingest service
//!
//! - SIMD-JSON request parsing
//! - Streams hashed onto shard worker threads; each shard owns its detectors
//! - Anomalies handed to a bounded sink channel
//! - Prometheus metrics

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use crossbeam_channel::{Receiver, Sender, bounded};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, IntCounter, IntGauge, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::detector::Verdict;
use crate::error::{DetectorError, ServiceError};
use crate::registry::{StreamRegistry, stream_hash};

// ============================================================================
// METRICS
// ============================================================================

fn register_counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid metric definition");
    prometheus::register(Box::new(c.clone())).expect("metric registered once");
    c
}

pub static INGEST_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| register_counter("ewma_ingest_total", "Total samples ingested"));

pub static ANOMALY_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| register_counter("ewma_anomalies_total", "Total anomalies detected"));

pub static DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "ewma_dropped_total",
        "Total samples dropped due to backpressure",
    )
});

pub static REJECTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "ewma_rejected_total",
        "Total samples rejected as non-finite",
    )
});

pub static EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "ewma_evictions_total",
        "Total stream detectors evicted due to memory pressure",
    )
});

pub static REPORTS_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "ewma_reports_dropped_total",
        "Total anomaly reports dropped because the sink was full",
    )
});

pub static ACTIVE_STREAMS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("ewma_active_streams", "Number of streams with a live detector")
        .expect("valid metric definition");
    prometheus::register(Box::new(g.clone())).expect("metric registered once");
    g
});

pub static PROCESSING_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "ewma_processing_duration_seconds",
        "Histogram of per-sample processing latency",
    ))
    .expect("valid metric definition");
    prometheus::register(Box::new(h.clone())).expect("metric registered once");
    h
});

fn init_metrics() {
    let _ = &*INGEST_TOTAL;
    let _ = &*ANOMALY_TOTAL;
    let _ = &*DROPPED_TOTAL;
    let _ = &*REJECTED_TOTAL;
    let _ = &*EVICTIONS_TOTAL;
    let _ = &*REPORTS_DROPPED_TOTAL;
    let _ = &*ACTIVE_STREAMS;
    let _ = &*PROCESSING_LATENCY;
}

// ============================================================================
// DATA TYPES
// ============================================================================

/// External API: one sample for one stream
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IngestEvent {
    pub stream: String,
    pub value: f64,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Internal: routed sample
#[derive(Debug, Clone)]
struct InternalEvent {
    stream: String,
    hash: u64,
    value: f64,
    timestamp: Option<u64>,
}

/// Anomaly handed to the sink
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub stream: String,
    pub shard: usize,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    pub verdict: Verdict,
}

/// Response to a batch ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    pub accepted: usize,
    pub dropped: usize,
}

#[derive(Clone)]
struct AppState {
    shard_txs: Arc<Vec<Sender<InternalEvent>>>,
}

// ============================================================================
// SIMD-JSON EXTRACTOR
// ============================================================================

struct SimdJson<T>(T);

impl<T, S> FromRequest<S> for SimdJson<T>
where
    T: for<'de> Deserialize<'de> + Send,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| e.into_response())?;
        let mut bytes_vec = bytes.to_vec();

        let val = simd_json::from_slice::<T>(&mut bytes_vec)
            .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid JSON").into_response())?;

        Ok(SimdJson(val))
    }
}

// ============================================================================
// SHARD WORKER
// ============================================================================

struct ShardWorker {
    id: usize,
    rx: Receiver<InternalEvent>,
    registry: StreamRegistry,
    sink: Sender<AnomalyReport>,
}

impl ShardWorker {
    fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("ewma-shard-{}", self.id))
            .spawn(move || {
                let mut worker = self;
                worker.run();
                info!(shard = worker.id, "Shard worker stopped.");
            })
    }

    fn run(&mut self) {
        debug!(shard = self.id, "Shard worker active.");

        while let Ok(event) = self.rx.recv() {
            let timer = PROCESSING_LATENCY.start_timer();
            self.process(event);
            timer.observe_duration();
        }
    }

    fn process(&mut self, event: InternalEvent) {
        let streams_before = self.registry.len() as i64;
        let evictions_before = self.registry.stats().evictions;

        let result = self.registry.observe_hashed(event.hash, event.value);

        ACTIVE_STREAMS.add(self.registry.len() as i64 - streams_before);
        EVICTIONS_TOTAL.inc_by(self.registry.stats().evictions - evictions_before);

        match result {
            Ok(verdict) if verdict.is_anomaly => {
                ANOMALY_TOTAL.inc();
                let report = AnomalyReport {
                    stream: event.stream,
                    shard: self.id,
                    value: event.value,
                    timestamp: event.timestamp,
                    verdict,
                };
                if self.sink.try_send(report).is_err() {
                    REPORTS_DROPPED_TOTAL.inc();
                    debug!(shard = self.id, "Anomaly sink full, report dropped");
                }
            }
            Ok(_) => {}
            Err(DetectorError::NonFiniteInput { value }) => {
                REJECTED_TOTAL.inc();
                warn!(shard = self.id, stream = %event.stream, value, "Rejected non-finite sample");
            }
            Err(e) => {
                warn!(shard = self.id, stream = %event.stream, error = %e, "Sample not processed");
            }
        }
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

fn route(event: IngestEvent, state: &AppState) -> bool {
    let hash = stream_hash(&event.stream);
    let shard_id = (hash as usize) % state.shard_txs.len();

    let internal = InternalEvent {
        stream: event.stream,
        hash,
        value: event.value,
        // Untimed samples are stamped on arrival (Unix nanoseconds).
        timestamp: event
            .timestamp
            .or_else(|| chrono::Utc::now().timestamp_nanos_opt().map(|t| t as u64)),
    };

    if state.shard_txs[shard_id].try_send(internal).is_err() {
        DROPPED_TOTAL.inc();
        return false;
    }
    true
}

async fn ingest(
    State(state): State<AppState>,
    SimdJson(event): SimdJson<IngestEvent>,
) -> StatusCode {
    INGEST_TOTAL.inc();
    if route(event, &state) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// 202 when every sample was queued, 503 when any was dropped. The body
/// carries both counts either way.
async fn ingest_batch(
    State(state): State<AppState>,
    SimdJson(events): SimdJson<Vec<IngestEvent>>,
) -> (StatusCode, Json<BatchAck>) {
    INGEST_TOTAL.inc_by(events.len() as u64);

    let mut ack = BatchAck {
        accepted: 0,
        dropped: 0,
    };
    for event in events {
        if route(event, &state) {
            ack.accepted += 1;
        } else {
            ack.dropped += 1;
        }
    }

    let status = if ack.dropped == 0 {
        StatusCode::ACCEPTED
    } else {
        warn!(accepted = ack.accepted, dropped = ack.dropped, "Batch partially dropped");
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ack))
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    match String::from_utf8(buffer) {
        Ok(body) => body.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

// ============================================================================
// SERVICE
// ============================================================================

/// Running shard workers plus the routing state the HTTP layer needs.
pub struct Gatekeeper {
    state: AppState,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Gatekeeper {
    /// Start the shard workers. Anomalies arrive on the returned receiver,
    /// which holds at most `sink_capacity` undelivered reports.
    pub fn spawn(
        config: &AppConfig,
        sink_capacity: usize,
    ) -> Result<(Self, Receiver<AnomalyReport>), ServiceError> {
        config.validate()?;
        init_metrics();

        let shard_count = config.server.effective_shards();
        let (sink_tx, sink_rx) = bounded::<AnomalyReport>(sink_capacity.max(1));

        let mut txs = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for id in 0..shard_count {
            let (tx, rx) = bounded::<InternalEvent>(config.server.queue_capacity);
            let worker = ShardWorker {
                id,
                rx,
                registry: StreamRegistry::with_config(config.detector, config.registry.clone())?,
                sink: sink_tx.clone(),
            };
            txs.push(tx);
            workers.push(worker.spawn()?);
        }

        info!(
            shards = shard_count,
            max_streams_per_shard = config.registry.max_streams,
            alpha = config.detector.alpha,
            k = config.detector.k,
            warmup = config.detector.warmup_count,
            "Shard workers started."
        );

        Ok((
            Self {
                state: AppState {
                    shard_txs: Arc::new(txs),
                },
                workers,
            },
            sink_rx,
        ))
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ingest", post(ingest))
            .route("/ingest/batch", post(ingest_batch))
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone())
    }

    pub fn shard_count(&self) -> usize {
        self.state.shard_txs.len()
    }

    /// Close the shard queues and wait for them to drain.
    ///
    /// Every router obtained from [`router`](Self::router) must be dropped
    /// first, otherwise the queues stay open.
    pub fn shutdown(self) {
        drop(self.state);
        for handle in self.workers {
            if handle.join().is_err() {
                warn!("Shard worker panicked");
            }
        }
        info!("All shards drained and stopped.");
    }
}
