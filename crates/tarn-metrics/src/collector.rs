//! Load aggregator — per-replica load, per-model request metrics, alerts.
//!
//! Maps are guarded by tokio `RwLock`s and hold `Arc`'d entries whose
//! counters are atomics, so concurrent scrapes of different replicas
//! only contend on the map lookup.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tarn_core::{Alert, ReplicaId, Severity};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::parser::{Sample, parse_exposition};

/// Latency samples kept per model.
pub const LATENCY_WINDOW: usize = 1000;
/// Alerts kept in the log.
pub const ALERT_CAPACITY: usize = 100;
/// Load reported for a replica that serves requests but exposes no GPU
/// utilization. A placeholder, not a measurement.
pub const SERVING_PLACEHOLDER_LOAD: f64 = 0.3;

const GPU_UTILIZATION: &str = "nv_gpu_utilization";
const REQUEST_SUCCESS: &str = "nv_inference_request_success";
const REQUEST_FAILURE: &str = "nv_inference_request_failure";
const INFERENCE_COUNT: &str = "nv_inference_count";
const REQUEST_DURATION_US: &str = "nv_inference_request_duration_us";
const PENDING_REQUESTS: &str = "nv_inference_pending_request_count";

// ── Load signal ───────────────────────────────────────────────────

/// Load scalar in [0, 1] for one replica's raw metrics text.
pub fn sample_load(text: &str) -> f64 {
    load_from_samples(&parse_exposition(text))
}

/// Mean GPU utilization (percent → fraction) when any is reported;
/// otherwise the serving placeholder if request counters exist;
/// otherwise idle. Utilization counts only when labelled with its GPU.
pub fn load_from_samples(samples: &[Sample]) -> f64 {
    let (total, count) = samples
        .iter()
        .filter(|s| s.name == GPU_UTILIZATION && gpu_label(s).is_some() && s.value.is_finite())
        .fold((0.0, 0usize), |(sum, n), s| (sum + s.value, n + 1));

    let load = if count > 0 {
        total / count as f64 / 100.0
    } else if samples.iter().any(|s| s.name == REQUEST_SUCCESS) {
        SERVING_PLACEHOLDER_LOAD
    } else {
        0.0
    };
    load.clamp(0.0, 1.0)
}

/// Arithmetic mean of per-replica loads; a failed sample is passed in as 0.
pub fn aggregate_load(loads: &[f64]) -> f64 {
    if loads.is_empty() {
        return 0.0;
    }
    loads.iter().sum::<f64>() / loads.len() as f64
}

/// GPU index → metric suffix → value, e.g. `"0" → {"utilization": 45.5}`.
pub type GpuMetrics = BTreeMap<String, BTreeMap<String, f64>>;

/// Group every `nv_gpu_*` sample by the GPU it describes.
pub fn gpu_metrics(samples: &[Sample]) -> GpuMetrics {
    let mut gpus = GpuMetrics::new();
    for s in samples {
        let Some(metric) = s.name.strip_prefix("nv_gpu_") else {
            continue;
        };
        let Some(gpu) = gpu_label(s) else {
            continue;
        };
        gpus.entry(gpu.to_string())
            .or_default()
            .insert(metric.to_string(), s.value);
    }
    gpus
}

fn gpu_label(sample: &Sample) -> Option<&str> {
    sample.label("gpu").or_else(|| sample.label("gpu_uuid"))
}

// ── Latency window ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Bounded FIFO of latency observations in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
}

impl LatencyWindow {
    pub fn push(&mut self, latency_ms: f64) {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nearest-rank percentile; 0 when empty.
    pub fn percentile(&self, p: f64) -> f64 {
        percentile(&self.sorted(), p)
    }

    pub fn percentiles(&self) -> LatencyPercentiles {
        let sorted = self.sorted();
        LatencyPercentiles {
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }

    fn sorted(&self) -> Vec<f64> {
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as i64 - 1;
    let index = rank.clamp(0, sorted.len() as i64 - 1) as usize;
    sorted[index]
}

// ── Per-model and per-replica state ───────────────────────────────

struct ModelMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    latencies: tokio::sync::Mutex<LatencyWindow>,
}

impl ModelMetrics {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies: tokio::sync::Mutex::new(LatencyWindow::default()),
        }
    }

    fn error_rate(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        self.errors.load(Ordering::Relaxed) as f64 / requests as f64
    }
}

/// Enriched metrics for one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelReport {
    pub model: String,
    pub latency_percentiles: LatencyPercentiles,
    pub error_rate: f64,
    pub request_count: u64,
    pub error_count: u64,
}

/// Cumulative Triton counters for one model, as of the last scrape.
#[derive(Debug, Clone, Copy, Default)]
struct ModelCounters {
    success: u64,
    failure: u64,
    count: u64,
    duration_us: u64,
}

#[derive(Debug, Default)]
struct ReplicaStats {
    host: String,
    load: f64,
    queue_depth: u64,
    gpus: GpuMetrics,
    started_at: Option<u64>,
    ready_at: Option<u64>,
    counters: HashMap<String, ModelCounters>,
}

/// Last observed state of one replica, for exposition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaLoad {
    pub replica_id: ReplicaId,
    pub host: String,
    pub load: f64,
    pub queue_depth: u64,
    pub gpus: GpuMetrics,
}

// ── Aggregator ────────────────────────────────────────────────────

#[derive(Default)]
pub struct LoadAggregator {
    models: RwLock<HashMap<String, Arc<ModelMetrics>>>,
    replicas: RwLock<HashMap<ReplicaId, ReplicaStats>>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl LoadAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one successful scrape of `replica_id` into the aggregator and
    /// return the replica's load.
    pub async fn ingest(&self, replica_id: &str, host: &str, text: &str) -> f64 {
        let samples = parse_exposition(text);
        let load = load_from_samples(&samples);
        let current = model_counters(&samples);

        let deltas = {
            let mut replicas = self.replicas.write().await;
            let stats = replicas.entry(replica_id.to_string()).or_default();
            stats.host = host.to_string();
            stats.load = load;
            stats.gpus = gpu_metrics(&samples);
            stats.queue_depth = samples
                .iter()
                .filter(|s| s.name == PENDING_REQUESTS && s.value.is_finite())
                .map(|s| s.value.max(0.0) as u64)
                .sum();

            let deltas: Vec<_> = current
                .iter()
                .map(|(model, now)| {
                    let before = stats.counters.get(model).copied().unwrap_or_default();
                    (model.clone(), counter_delta(before, *now))
                })
                .collect();
            stats.counters = current;
            deltas
        };

        for (model, delta) in deltas {
            let requests = delta.success + delta.failure;
            if requests == 0 && delta.count == 0 {
                continue;
            }
            let entry = self.model_entry(&model).await;
            entry.requests.fetch_add(requests, Ordering::Relaxed);
            entry.errors.fetch_add(delta.failure, Ordering::Relaxed);
            if delta.count > 0 {
                let latency_ms = delta.duration_us as f64 / delta.count as f64 / 1000.0;
                entry.latencies.lock().await.push(latency_ms);
            }
        }

        debug!(replica = %replica_id, load, "ingested replica metrics");
        load
    }

    /// Record that a replica produced no sample this tick.
    pub async fn record_unavailable(&self, replica_id: &str, host: &str) {
        let mut replicas = self.replicas.write().await;
        let stats = replicas.entry(replica_id.to_string()).or_default();
        stats.host = host.to_string();
        stats.load = 0.0;
    }

    /// Drop everything kept for a departed replica.
    pub async fn forget_replica(&self, replica_id: &str) {
        self.replicas.write().await.remove(replica_id);
    }

    pub async fn replica_loads(&self) -> Vec<ReplicaLoad> {
        let replicas = self.replicas.read().await;
        let mut out: Vec<_> = replicas
            .iter()
            .map(|(id, s)| ReplicaLoad {
                replica_id: id.clone(),
                host: s.host.clone(),
                load: s.load,
                queue_depth: s.queue_depth,
                gpus: s.gpus.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.replica_id.cmp(&b.replica_id));
        out
    }

    // ── Startup latency ───────────────────────────────────────────

    pub async fn record_start(&self, replica_id: &str, at_ms: u64) {
        let mut replicas = self.replicas.write().await;
        replicas.entry(replica_id.to_string()).or_default().started_at = Some(at_ms);
    }

    pub async fn record_ready(&self, replica_id: &str, at_ms: u64) {
        let mut replicas = self.replicas.write().await;
        replicas.entry(replica_id.to_string()).or_default().ready_at = Some(at_ms);
    }

    /// Ready minus start, once both are known.
    pub async fn startup_latency_ms(&self, replica_id: &str) -> Option<u64> {
        let replicas = self.replicas.read().await;
        let stats = replicas.get(replica_id)?;
        Some(stats.ready_at?.saturating_sub(stats.started_at?))
    }

    // ── Queue depth ───────────────────────────────────────────────

    pub async fn queue_depth(&self, replica_id: &str) -> u64 {
        self.replicas
            .read()
            .await
            .get(replica_id)
            .map(|s| s.queue_depth)
            .unwrap_or(0)
    }

    pub async fn total_queue_depth(&self) -> u64 {
        self.replicas.read().await.values().map(|s| s.queue_depth).sum()
    }

    // ── Per-model metrics ─────────────────────────────────────────

    async fn model_entry(&self, model: &str) -> Arc<ModelMetrics> {
        if let Some(m) = self.models.read().await.get(model) {
            return m.clone();
        }
        self.models
            .write()
            .await
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(ModelMetrics::new()))
            .clone()
    }

    pub async fn record_latency(&self, model: &str, latency_ms: f64) {
        self.model_entry(model).await.latencies.lock().await.push(latency_ms);
    }

    pub async fn record_request(&self, model: &str, success: bool) {
        let m = self.model_entry(model).await;
        m.requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            m.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn latency_percentiles(&self, model: &str) -> LatencyPercentiles {
        let Some(m) = self.models.read().await.get(model).cloned() else {
            return LatencyPercentiles::default();
        };
        let window = m.latencies.lock().await;
        window.percentiles()
    }

    /// errors / requests, 0 before any request.
    pub async fn error_rate(&self, model: &str) -> f64 {
        self.models
            .read()
            .await
            .get(model)
            .map(|m| m.error_rate())
            .unwrap_or(0.0)
    }

    pub async fn all_error_rates(&self) -> BTreeMap<String, f64> {
        self.models
            .read()
            .await
            .iter()
            .map(|(model, m)| (model.clone(), m.error_rate()))
            .collect()
    }

    pub async fn tracked_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.models.read().await.keys().cloned().collect();
        models.sort();
        models
    }

    /// `None` for a model never observed.
    pub async fn model_metrics(&self, model: &str) -> Option<ModelReport> {
        let m = self.models.read().await.get(model).cloned()?;
        let latency_percentiles = m.latencies.lock().await.percentiles();
        Some(ModelReport {
            model: model.to_string(),
            latency_percentiles,
            error_rate: m.error_rate(),
            request_count: m.requests.load(Ordering::Relaxed),
            error_count: m.errors.load(Ordering::Relaxed),
        })
    }

    pub async fn model_reports(&self) -> Vec<ModelReport> {
        let mut out = Vec::new();
        for model in self.tracked_models().await {
            if let Some(report) = self.model_metrics(&model).await {
                out.push(report);
            }
        }
        out
    }

    // ── Alerts ────────────────────────────────────────────────────

    pub fn record_alert(&self, kind: &str, message: impl Into<String>, severity: Severity) {
        let alert = Alert::new(kind, message, severity);
        warn!(
            kind = %alert.kind,
            severity = %alert.severity,
            "ALERT [{}] {}: {}",
            alert.severity,
            alert.kind,
            alert.message
        );
        let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
        if alerts.len() == ALERT_CAPACITY {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    pub fn record_replica_failure(&self, replica_id: &str, reason: &str) {
        self.record_alert(
            "container_failure",
            format!("Container {replica_id} failed: {reason}"),
            Severity::Critical,
        );
    }

    pub fn record_scaling_event(&self, event: &str, from: u32, to: u32) {
        self.record_alert(
            "scaling_event",
            format!("{event} from {from} to {to} containers"),
            Severity::Info,
        );
    }

    /// Oldest first.
    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

fn model_counters(samples: &[Sample]) -> HashMap<String, ModelCounters> {
    let mut out: HashMap<String, ModelCounters> = HashMap::new();
    for s in samples {
        let Some(model) = s.label("model") else {
            continue;
        };
        if !s.value.is_finite() || s.value < 0.0 {
            continue;
        }
        if !matches!(
            s.name.as_str(),
            REQUEST_SUCCESS | REQUEST_FAILURE | INFERENCE_COUNT | REQUEST_DURATION_US
        ) {
            continue;
        }
        let value = s.value as u64;
        // Versions of the same model add up.
        let counters = out.entry(model.to_string()).or_default();
        match s.name.as_str() {
            REQUEST_SUCCESS => counters.success += value,
            REQUEST_FAILURE => counters.failure += value,
            INFERENCE_COUNT => counters.count += value,
            _ => counters.duration_us += value,
        }
    }
    out
}

/// Growth since `before`; a counter that went backwards restarted from zero.
fn counter_delta(before: ModelCounters, now: ModelCounters) -> ModelCounters {
    let delta = |b: u64, n: u64| if n >= b { n - b } else { n };
    ModelCounters {
        success: delta(before.success, now.success),
        failure: delta(before.failure, now.failure),
        count: delta(before.count, now.count),
        duration_us: delta(before.duration_us, now.duration_us),
    }
}
