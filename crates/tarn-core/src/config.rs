//! tarn.toml configuration model.
//!
//! Every section carries `#[serde(default)]`, so an empty file yields
//! the stock deployment: one Triton replica per node on the `nvidia`
//! placement tag, scaling between 1 and 10 replicas.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{PlacementConstraint, ResourceCapability};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TarnConfig {
    pub server: ServerConfig,
    pub container: ContainerConfig,
    pub scaling: ScalingConfig,
    pub controller: ControllerConfig,
    pub api: ApiConfig,
    pub cluster: ClusterConfig,
}

/// How each replica's inference server is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub image: String,
    /// `hdfs:///...` (staged locally before launch) or a local path.
    pub model_repository: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub metrics_port: u16,
    pub bind_address: String,
    pub tensor_parallelism: u32,
    pub pipeline_parallelism: u32,
    pub secrets_path: Option<String>,
    /// Model loaded explicitly by non-zero ranks in multi-rank launches.
    pub rank_model: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            image: "nvcr.io/nvidia/tritonserver:24.09-py3".to_string(),
            model_repository: "hdfs:///models".to_string(),
            http_port: 8000,
            grpc_port: 8001,
            metrics_port: 8002,
            bind_address: "0.0.0.0".to_string(),
            tensor_parallelism: 1,
            pipeline_parallelism: 1,
            secrets_path: None,
            rank_model: Some("tensorrt_llm".to_string()),
        }
    }
}

impl ServerConfig {
    /// Accelerators one replica occupies.
    pub fn world_size(&self) -> u32 {
        self.tensor_parallelism.saturating_mul(self.pipeline_parallelism)
    }
}

/// Container sizing, placement, and runtime environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub memory_mb: u64,
    pub vcores: u32,
    pub placement_tag: String,
    pub docker_network: Option<String>,
    pub docker_privileged: bool,
    pub docker_delayed_removal: bool,
    pub docker_mounts: Option<String>,
    pub docker_ports: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            memory_mb: 4096,
            vcores: 2,
            placement_tag: "nvidia".to_string(),
            docker_network: Some("host".to_string()),
            docker_privileged: false,
            docker_delayed_removal: false,
            docker_mounts: None,
            docker_ports: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub up_threshold: f64,
    pub down_threshold: f64,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Minimum time between two scaling changes (e.g., "60s").
    pub cooldown: String,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            up_threshold: 0.7,
            down_threshold: 0.2,
            min_replicas: 1,
            max_replicas: 10,
            cooldown: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Reconcile tick period.
    pub tick_interval: String,
    /// Timeout for a single `/metrics` scrape.
    pub probe_timeout: String,
    /// Timeout for a single readiness probe.
    pub ready_timeout: String,
    /// Outstanding allocation requests older than this are forgotten.
    pub allocation_timeout: String,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: "15s".to_string(),
            probe_timeout: "3s".to_string(),
            ready_timeout: "2s".to_string(),
            allocation_timeout: "120s".to_string(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: String,
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: "30s".to_string(),
            half_open_max_probes: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: String,
    pub max_delay: String,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: "100ms".to_string(),
            max_delay: "5s".to_string(),
            multiplier: 2.0,
        }
    }
}

/// Discovery / status HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    pub bind_address: String,
    /// Shared secret required on every route but `/health` when set.
    pub token: Option<String>,
    /// Access rules; when empty every request is allowed.
    pub rules: Vec<AccessRule>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8888,
            bind_address: "0.0.0.0".to_string(),
            token: None,
            rules: Vec::new(),
        }
    }
}

/// One authorization rule. Empty lists and `*` match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessRule {
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
    pub allow: bool,
}

/// Static node list used by standalone mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    /// Directory receiving per-replica stdout/stderr in standalone mode.
    pub log_dir: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: vec![NodeConfig::default()],
            log_dir: "/tmp/tarn".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub memory_mb: u64,
    pub vcores: u32,
    pub gpus: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            host: "127.0.0.1".to_string(),
            memory_mb: 65_536,
            vcores: 16,
            gpus: 8,
        }
    }
}

impl NodeConfig {
    pub fn capability(&self) -> ResourceCapability {
        ResourceCapability::new(self.memory_mb, self.vcores, self.gpus)
    }
}

impl TarnConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resources requested for each replica.
    pub fn capability(&self) -> ResourceCapability {
        ResourceCapability::new(
            self.container.memory_mb,
            self.container.vcores,
            self.server.world_size(),
        )
    }

    pub fn placement(&self) -> PlacementConstraint {
        PlacementConstraint::anti_affinity(self.container.placement_tag.clone())
    }

    pub fn cooldown(&self) -> ConfigResult<Duration> {
        duration_field("scaling.cooldown", &self.scaling.cooldown)
    }

    pub fn tick_interval(&self) -> ConfigResult<Duration> {
        duration_field("controller.tick_interval", &self.controller.tick_interval)
    }

    pub fn probe_timeout(&self) -> ConfigResult<Duration> {
        duration_field("controller.probe_timeout", &self.controller.probe_timeout)
    }

    pub fn ready_timeout(&self) -> ConfigResult<Duration> {
        duration_field("controller.ready_timeout", &self.controller.ready_timeout)
    }

    pub fn allocation_timeout(&self) -> ConfigResult<Duration> {
        duration_field(
            "controller.allocation_timeout",
            &self.controller.allocation_timeout,
        )
    }

    pub fn breaker_reset_timeout(&self) -> ConfigResult<Duration> {
        duration_field(
            "controller.breaker.reset_timeout",
            &self.controller.breaker.reset_timeout,
        )
    }

    pub fn retry_delays(&self) -> ConfigResult<(Duration, Duration)> {
        let initial = duration_field(
            "controller.retry.initial_delay",
            &self.controller.retry.initial_delay,
        )?;
        let max = duration_field("controller.retry.max_delay", &self.controller.retry.max_delay)?;
        Ok((initial, max))
    }

    /// Check cross-field invariants. Called once at startup.
    pub fn validate(&self) -> ConfigResult<()> {
        let s = &self.scaling;
        if s.min_replicas > s.max_replicas {
            return Err(ConfigError::Invalid(format!(
                "scaling.min_replicas ({}) exceeds scaling.max_replicas ({})",
                s.min_replicas, s.max_replicas
            )));
        }
        if s.max_replicas == 0 {
            return Err(ConfigError::Invalid(
                "scaling.max_replicas must be at least 1".to_string(),
            ));
        }
        for (name, value) in [("up_threshold", s.up_threshold), ("down_threshold", s.down_threshold)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "scaling.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if s.down_threshold >= s.up_threshold {
            return Err(ConfigError::Invalid(format!(
                "scaling.down_threshold ({}) must be below scaling.up_threshold ({})",
                s.down_threshold, s.up_threshold
            )));
        }
        if self.server.world_size() == 0 {
            return Err(ConfigError::Invalid(
                "tensor and pipeline parallelism must both be at least 1".to_string(),
            ));
        }
        if self.controller.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "controller.breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.controller.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "controller.retry.multiplier must be >= 1.0, got {}",
                self.controller.retry.multiplier
            )));
        }

        self.cooldown()?;
        let tick = self.tick_interval()?;
        if tick.is_zero() {
            return Err(ConfigError::Invalid(
                "controller.tick_interval must be positive".to_string(),
            ));
        }
        self.probe_timeout()?;
        self.ready_timeout()?;
        self.allocation_timeout()?;
        self.breaker_reset_timeout()?;
        self.retry_delays()?;
        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "2m", "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled_secs(mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled_secs(hours, 3600)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn scaled_secs(value: &str, unit: u64) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()?
        .checked_mul(unit)
        .map(Duration::from_secs)
}
