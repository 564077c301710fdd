//! Prometheus text exposition for the controller itself.
//!
//! Renders the controller's view of the replica set (target, running,
//! per-replica load and GPU gauges) and per-model request metrics for
//! scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use crate::collector::{ModelReport, ReplicaLoad};

/// Controller-level gauges taken from one status snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControllerGauges {
    pub target: u32,
    pub running: usize,
    pub pending: usize,
    pub aggregate_load: f64,
}

/// Render controller, replica, and model gauges into Prometheus text format.
pub fn render_prometheus(
    gauges: &ControllerGauges,
    replicas: &[ReplicaLoad],
    models: &[ModelReport],
) -> String {
    let mut out = String::new();

    header(&mut out, "tarn_target_replicas", "Desired replica count.");
    let _ = writeln!(out, "tarn_target_replicas {}", gauges.target);

    header(&mut out, "tarn_running_replicas", "Replicas in the running set.");
    let _ = writeln!(out, "tarn_running_replicas {}", gauges.running);

    header(
        &mut out,
        "tarn_pending_allocations",
        "Allocation requests not yet granted.",
    );
    let _ = writeln!(out, "tarn_pending_allocations {}", gauges.pending);

    header(&mut out, "tarn_aggregate_load", "Mean replica load (0.0-1.0).");
    let _ = writeln!(out, "tarn_aggregate_load {:.4}", gauges.aggregate_load);

    header(&mut out, "tarn_replica_load", "Per-replica load (0.0-1.0).");
    for r in replicas {
        let _ = writeln!(
            out,
            "tarn_replica_load{{replica_id=\"{}\",host=\"{}\"}} {:.4}",
            escape(&r.replica_id),
            escape(&r.host),
            r.load
        );
    }

    // One family per GPU metric suffix, e.g. tarn_gpu_utilization.
    let mut families: Vec<&str> = replicas
        .iter()
        .flat_map(|r| r.gpus.values())
        .flat_map(|metrics| metrics.keys().map(String::as_str))
        .collect();
    families.sort_unstable();
    families.dedup();
    for family in families {
        let name = format!("tarn_gpu_{}", sanitize(family));
        header(&mut out, &name, "GPU metric reported by the replica.");
        for r in replicas {
            for (gpu, metrics) in &r.gpus {
                if let Some(value) = metrics.get(family) {
                    let _ = writeln!(
                        out,
                        "{name}{{replica_id=\"{}\",host=\"{}\",gpu=\"{}\"}} {}",
                        escape(&r.replica_id),
                        escape(&r.host),
                        escape(gpu),
                        value
                    );
                }
            }
        }
    }

    header(&mut out, "tarn_model_error_rate", "Model error rate (0.0-1.0).");
    for m in models {
        let _ = writeln!(
            out,
            "tarn_model_error_rate{{model=\"{}\"}} {:.4}",
            escape(&m.model),
            m.error_rate
        );
    }

    header(
        &mut out,
        "tarn_model_latency_ms",
        "Model inference latency percentiles in milliseconds.",
    );
    for m in models {
        let p = &m.latency_percentiles;
        for (quantile, value) in [("0.5", p.p50), ("0.95", p.p95), ("0.99", p.p99)] {
            let _ = writeln!(
                out,
                "tarn_model_latency_ms{{model=\"{}\",quantile=\"{quantile}\"}} {value:.2}",
                escape(&m.model)
            );
        }
    }

    out
}

fn header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{GpuMetrics, LatencyPercentiles};
    use crate::parser::parse_exposition;

    fn test_replica(id: &str, load: f64) -> ReplicaLoad {
        let mut gpus = GpuMetrics::new();
        gpus.entry("0".to_string())
            .or_default()
            .insert("utilization".to_string(), 45.5);
        ReplicaLoad {
            replica_id: id.to_string(),
            host: "10.0.0.1".to_string(),
            load,
            queue_depth: 0,
            gpus,
        }
    }

    fn test_model() -> ModelReport {
        ModelReport {
            model: "llama".to_string(),
            latency_percentiles: LatencyPercentiles {
                p50: 5.2,
                p95: 20.0,
                p99: 45.8,
            },
            error_rate: 0.012,
            request_count: 1000,
            error_count: 12,
        }
    }

    fn test_gauges() -> ControllerGauges {
        ControllerGauges {
            target: 3,
            running: 2,
            pending: 1,
            aggregate_load: 0.505,
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&ControllerGauges::default(), &[], &[]);
        assert!(output.contains("# TYPE tarn_target_replicas gauge"));
        assert!(output.contains("tarn_target_replicas 0\n"));
        assert!(output.contains("# HELP tarn_replica_load"));
        assert!(!output.contains("tarn_gpu_"));
    }

    #[test]
    fn render_controller_replica_and_model_gauges() {
        let output = render_prometheus(
            &test_gauges(),
            &[test_replica("container_01", 0.455)],
            &[test_model()],
        );

        assert!(output.contains("tarn_target_replicas 3\n"));
        assert!(output.contains("tarn_running_replicas 2\n"));
        assert!(output.contains("tarn_pending_allocations 1\n"));
        assert!(output.contains("tarn_aggregate_load 0.5050\n"));
        assert!(output.contains(
            "tarn_replica_load{replica_id=\"container_01\",host=\"10.0.0.1\"} 0.4550"
        ));
        assert!(output.contains(
            "tarn_gpu_utilization{replica_id=\"container_01\",host=\"10.0.0.1\",gpu=\"0\"} 45.5"
        ));
        assert!(output.contains("tarn_model_error_rate{model=\"llama\"} 0.0120"));
        assert!(output.contains("tarn_model_latency_ms{model=\"llama\",quantile=\"0.99\"} 45.80"));
    }

    #[test]
    fn gpu_family_declared_once() {
        let output = render_prometheus(
            &test_gauges(),
            &[test_replica("a", 0.1), test_replica("b", 0.2)],
            &[],
        );
        assert_eq!(output.matches("# TYPE tarn_gpu_utilization gauge").count(), 1);
        assert_eq!(output.matches("tarn_gpu_utilization{").count(), 2);
    }

    #[test]
    fn output_parses_back() {
        let output = render_prometheus(&test_gauges(), &[test_replica("a\"b", 0.3)], &[test_model()]);
        let samples = parse_exposition(&output);
        let load = samples.iter().find(|s| s.name == "tarn_replica_load").unwrap();
        assert_eq!(load.label("replica_id"), Some("a\"b"));
        assert_eq!(load.value, 0.3);
    }
}
