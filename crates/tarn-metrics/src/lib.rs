//! tarn-metrics — replica telemetry for the Tarn controller.
//!
//! Turns the raw text a replica serves on its metrics endpoint into the
//! load signal the scaling decision runs on, and keeps the secondary
//! observability state (per-model latency and error rates, queue depth,
//! startup latency, alerts) that the status API renders.
//!
//! # Architecture
//!
//! ```text
//! replica /metrics text
//!   └── parse_exposition() → Vec<Sample>          (pure, no I/O)
//!         └── LoadAggregator::ingest()
//!               ├── load_from_samples() → f64 in [0, 1]
//!               ├── GPU metrics, queue depth
//!               └── per-model counters + LatencyWindow (1000 samples)
//!
//! Alert log (100 entries, FIFO)
//!   └── record_alert() ← scaling events, replica failures
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for the controller's /metrics
//! ```

pub mod collector;
pub mod parser;
pub mod prometheus;

pub use collector::{
    GpuMetrics, LatencyPercentiles, LatencyWindow, LoadAggregator, ModelReport, ReplicaLoad,
    aggregate_load, gpu_metrics, load_from_samples, sample_load,
};
pub use parser::{Sample, parse_exposition};
pub use prometheus::{ControllerGauges, render_prometheus};
