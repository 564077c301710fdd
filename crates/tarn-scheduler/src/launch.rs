//! Launch command construction for an inference-server replica.
//!
//! Pure string building: no I/O, so every shape of command can be
//! checked against a literal.

use std::collections::BTreeMap;

use tarn_core::{ContainerConfig, ServerConfig, TarnConfig};

use crate::cluster::LaunchContext;
use crate::error::{LaunchError, LaunchResult};

/// Local directory a remote model repository is staged into.
pub const LOCAL_MODEL_DIR: &str = "/models";
/// Where a remote secrets file is staged.
pub const LOCAL_SECRETS_FILE: &str = "/secrets/secrets.jks";
/// Port offset between consecutive ranks.
pub const RANK_PORT_STRIDE: u16 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSet {
    pub http: u16,
    pub grpc: u16,
    pub metrics: u16,
}

impl Default for PortSet {
    fn default() -> Self {
        Self {
            http: 8000,
            grpc: 8001,
            metrics: 8002,
        }
    }
}

impl PortSet {
    /// Ports for `rank`: each base port plus `rank * 10`.
    pub fn for_rank(&self, rank: u32) -> LaunchResult<PortSet> {
        let offset = u16::try_from(rank)
            .ok()
            .and_then(|r| r.checked_mul(RANK_PORT_STRIDE))
            .ok_or_else(|| LaunchError::InvalidSpec(format!("rank {rank} port offset overflows")))?;
        let shift = |base: u16| {
            base.checked_add(offset).ok_or_else(|| {
                LaunchError::InvalidSpec(format!("port {base} + {offset} for rank {rank} overflows"))
            })
        };
        Ok(PortSet {
            http: shift(self.http)?,
            grpc: shift(self.grpc)?,
            metrics: shift(self.metrics)?,
        })
    }
}

/// Builds the shell command that starts one replica.
#[derive(Debug, Clone)]
pub struct LaunchSpecBuilder {
    model_repository: String,
    ports: PortSet,
    bind_address: String,
    tensor_parallelism: u32,
    pipeline_parallelism: u32,
    secrets_path: Option<String>,
    rank_model: Option<String>,
}

impl Default for LaunchSpecBuilder {
    fn default() -> Self {
        Self {
            model_repository: String::new(),
            ports: PortSet::default(),
            bind_address: "0.0.0.0".to_string(),
            tensor_parallelism: 1,
            pipeline_parallelism: 1,
            secrets_path: None,
            rank_model: Some("tensorrt_llm".to_string()),
        }
    }
}

impl LaunchSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        Self {
            model_repository: server.model_repository.clone(),
            ports: PortSet {
                http: server.http_port,
                grpc: server.grpc_port,
                metrics: server.metrics_port,
            },
            bind_address: server.bind_address.clone(),
            tensor_parallelism: server.tensor_parallelism,
            pipeline_parallelism: server.pipeline_parallelism,
            secrets_path: server.secrets_path.clone(),
            rank_model: server.rank_model.clone(),
        }
    }

    pub fn model_repository(mut self, location: impl Into<String>) -> Self {
        self.model_repository = location.into();
        self
    }

    pub fn ports(mut self, ports: PortSet) -> Self {
        self.ports = ports;
        self
    }

    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn parallelism(mut self, tensor: u32, pipeline: u32) -> Self {
        self.tensor_parallelism = tensor;
        self.pipeline_parallelism = pipeline;
        self
    }

    pub fn secrets_path(mut self, path: Option<String>) -> Self {
        self.secrets_path = path.filter(|p| !p.is_empty());
        self
    }

    /// Model that non-zero ranks load explicitly; `None` omits `--load-model`.
    pub fn rank_model(mut self, model: Option<String>) -> Self {
        self.rank_model = model;
        self
    }

    pub fn world_size(&self) -> u64 {
        u64::from(self.tensor_parallelism) * u64::from(self.pipeline_parallelism)
    }

    pub fn build(&self) -> LaunchResult<String> {
        let world_size = self.world_size();
        if world_size < 1 {
            return Err(LaunchError::InvalidSpec(format!(
                "world size must be at least 1 (tensor={}, pipeline={})",
                self.tensor_parallelism, self.pipeline_parallelism
            )));
        }
        let world_size = u32::try_from(world_size)
            .map_err(|_| LaunchError::InvalidSpec(format!("world size {world_size} too large")))?;

        let (staging, model_path) = self.model_location();
        let mut cmd = staging;

        if let Some(secrets) = &self.secrets_path {
            cmd.push_str(&format!(
                "mkdir -p /secrets && hadoop fs -copyToLocal {secrets} {LOCAL_SECRETS_FILE} && "
            ));
        }

        if world_size == 1 {
            cmd.push_str(&format!("tritonserver --model-repository={model_path} "));
            cmd.push_str(&self.serving_args(self.ports));
            return Ok(cmd.trim_end().to_string());
        }

        let mut ranks = Vec::with_capacity(world_size as usize);
        for rank in 0..world_size {
            let mut r = format!(
                "-n 1 tritonserver --id=rank{rank} --model-repository={model_path} \
                 --backend-config=python,shm-region-prefix-name=rank{rank}_ "
            );
            if rank == 0 {
                r.push_str(&self.serving_args(self.ports));
            } else {
                let ports = self.ports.for_rank(rank)?;
                r.push_str(&format!(
                    "--http-port={} --grpc-port={} --metrics-port={} \
                     --allow-http=false --allow-grpc=false --allow-metrics=false \
                     --log-info=false --log-warning=false --model-control-mode=explicit ",
                    ports.http, ports.grpc, ports.metrics
                ));
                if let Some(model) = &self.rank_model {
                    r.push_str(&format!("--load-model={model} "));
                }
                r.push_str("--model-load-thread-count=2");
            }
            ranks.push(r.trim_end().to_string());
        }
        cmd.push_str("mpirun --allow-run-as-root ");
        cmd.push_str(&ranks.join(" : "));
        Ok(cmd)
    }

    /// Staging prefix and the path the server reads models from.
    fn model_location(&self) -> (String, String) {
        let repo = self.model_repository.trim();
        if repo.is_empty() {
            return (String::new(), LOCAL_MODEL_DIR.to_string());
        }
        if let Some(path) = repo.strip_prefix("file://") {
            return (String::new(), path.to_string());
        }
        if is_remote(repo) {
            let repo = repo.trim_end_matches('/');
            let staging = format!(
                "mkdir -p {LOCAL_MODEL_DIR} && hadoop fs -copyToLocal {repo}/* {LOCAL_MODEL_DIR} && "
            );
            return (staging, LOCAL_MODEL_DIR.to_string());
        }
        (String::new(), repo.to_string())
    }

    fn serving_args(&self, ports: PortSet) -> String {
        let bind = &self.bind_address;
        format!(
            "--http-port={} --grpc-port={} --metrics-port={} \
             --http-address={bind} --grpc-address={bind} --metrics-address={bind} \
             --allow-cpu-metrics=false --allow-gpu-metrics=true --allow-metrics=true \
             --metrics-interval-ms=1000 --model-load-thread-count=2 --strict-readiness=true",
            ports.http, ports.grpc, ports.metrics
        )
    }
}

/// `scheme://...` other than `file://`.
pub fn is_remote(location: &str) -> bool {
    match location.split_once("://") {
        Some((scheme, _)) => {
            !scheme.is_empty()
                && scheme != "file"
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Container runtime environment for one replica.
///
/// Configured custom variables are applied last and win.
pub fn container_environment(
    image: &str,
    container: &ContainerConfig,
    replica_id: &str,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |k: &str, v: &str| {
        env.insert(k.to_string(), v.to_string());
    };
    set("YARN_CONTAINER_RUNTIME_TYPE", "docker");
    set("YARN_CONTAINER_RUNTIME_DOCKER_IMAGE", image);
    set("YARN_CONTAINER_RUNTIME_DOCKER_RUN_OVERRIDE_DISABLE", "true");
    if let Some(network) = container.docker_network.as_deref().filter(|n| !n.is_empty()) {
        set("YARN_CONTAINER_RUNTIME_DOCKER_CONTAINER_NETWORK", network);
    }
    if container.docker_privileged {
        set("YARN_CONTAINER_RUNTIME_DOCKER_RUN_PRIVILEGED_CONTAINER", "true");
    }
    if container.docker_delayed_removal {
        set("YARN_CONTAINER_RUNTIME_DOCKER_DELAYED_REMOVAL", "true");
    }
    if let Some(mounts) = container.docker_mounts.as_deref().filter(|m| !m.is_empty()) {
        set("YARN_CONTAINER_RUNTIME_DOCKER_MOUNTS", mounts);
    }
    if let Some(ports) = container.docker_ports.as_deref().filter(|p| !p.is_empty()) {
        set("YARN_CONTAINER_RUNTIME_DOCKER_PORTS_MAPPING", ports);
    }
    set("YARN_CONTAINER_RUNTIME_DOCKER_CONTAINER_HOSTNAME", replica_id);
    set("YARN_CONTAINER_RUNTIME_DOCKER_LOCAL_RESOURCE_MOUNTS", "true");

    for (k, v) in &container.env {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Everything needed to launch any replica of the workload. The command
/// is built and validated once; only the environment varies per replica.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub command: String,
    pub image: String,
    pub container: ContainerConfig,
}

impl LaunchPlan {
    pub fn from_config(config: &TarnConfig) -> LaunchResult<Self> {
        Ok(Self {
            command: LaunchSpecBuilder::from_config(&config.server).build()?,
            image: config.server.image.clone(),
            container: config.container.clone(),
        })
    }

    /// A plan that runs `command` verbatim, with no container settings.
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            image: String::new(),
            container: ContainerConfig::default(),
        }
    }

    pub fn context_for(&self, replica_id: &str) -> LaunchContext {
        LaunchContext {
            command: self.command.clone(),
            env: container_environment(&self.image, &self.container, replica_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVING: &str = "--http-port=8000 --grpc-port=8001 --metrics-port=8002 \
--http-address=0.0.0.0 --grpc-address=0.0.0.0 --metrics-address=0.0.0.0 \
--allow-cpu-metrics=false --allow-gpu-metrics=true --allow-metrics=true \
--metrics-interval-ms=1000 --model-load-thread-count=2 --strict-readiness=true";

    #[test]
    fn single_process_with_local_repository() {
        let cmd = LaunchSpecBuilder::new()
            .model_repository("/opt/models")
            .build()
            .unwrap();
        assert_eq!(cmd, format!("tritonserver --model-repository=/opt/models {SERVING}"));
        assert!(!cmd.contains("mpirun"));
        assert!(!cmd.contains("8010"));
    }

    #[test]
    fn remote_repository_is_staged_first() {
        let cmd = LaunchSpecBuilder::new()
            .model_repository("hdfs:///models/llama/")
            .build()
            .unwrap();
        assert_eq!(
            cmd,
            format!(
                "mkdir -p /models && hadoop fs -copyToLocal hdfs:///models/llama/* /models && \
                 tritonserver --model-repository=/models {SERVING}"
            )
        );
    }

    #[test]
    fn file_scheme_and_empty_repository_are_local() {
        let cmd = LaunchSpecBuilder::new()
            .model_repository("file:///srv/models")
            .build()
            .unwrap();
        assert!(cmd.starts_with("tritonserver --model-repository=/srv/models "));

        let cmd = LaunchSpecBuilder::new().build().unwrap();
        assert!(cmd.starts_with("tritonserver --model-repository=/models "));
    }

    #[test]
    fn secrets_are_staged_after_models() {
        let cmd = LaunchSpecBuilder::new()
            .model_repository("s3://bucket/models")
            .secrets_path(Some("hdfs:///user/tarn/secrets.jks".to_string()))
            .build()
            .unwrap();
        let models = cmd.find("s3://bucket/models/*").unwrap();
        let secrets = cmd
            .find("mkdir -p /secrets && hadoop fs -copyToLocal hdfs:///user/tarn/secrets.jks /secrets/secrets.jks && ")
            .unwrap();
        let server = cmd.find("tritonserver").unwrap();
        assert!(models < secrets && secrets < server);
    }

    #[test]
    fn two_ranks_offset_and_disable_secondary_surfaces() {
        let cmd = LaunchSpecBuilder::new()
            .model_repository("/opt/models")
            .parallelism(2, 1)
            .build()
            .unwrap();
        let expected = format!(
            "mpirun --allow-run-as-root \
             -n 1 tritonserver --id=rank0 --model-repository=/opt/models \
             --backend-config=python,shm-region-prefix-name=rank0_ {SERVING} : \
             -n 1 tritonserver --id=rank1 --model-repository=/opt/models \
             --backend-config=python,shm-region-prefix-name=rank1_ \
             --http-port=8010 --grpc-port=8011 --metrics-port=8012 \
             --allow-http=false --allow-grpc=false --allow-metrics=false \
             --log-info=false --log-warning=false --model-control-mode=explicit \
             --load-model=tensorrt_llm --model-load-thread-count=2"
        );
        assert_eq!(cmd, expected);
    }

    #[test]
    fn world_size_is_tensor_times_pipeline() {
        let cmd = LaunchSpecBuilder::new()
            .parallelism(2, 2)
            .rank_model(None)
            .build()
            .unwrap();
        assert_eq!(cmd.matches("-n 1 tritonserver").count(), 4);
        assert!(cmd.contains("--id=rank3"));
        assert!(cmd.contains("--http-port=8030 --grpc-port=8031 --metrics-port=8032"));
        assert!(!cmd.contains("--load-model"));
    }

    #[test]
    fn zero_parallelism_is_invalid() {
        let err = LaunchSpecBuilder::new().parallelism(0, 4).build().unwrap_err();
        assert!(matches!(err, LaunchError::InvalidSpec(_)));
        let err = LaunchSpecBuilder::new().parallelism(2, 0).build().unwrap_err();
        assert!(matches!(err, LaunchError::InvalidSpec(_)));
    }

    #[test]
    fn rank_port_overflow_is_invalid() {
        let err = LaunchSpecBuilder::new()
            .ports(PortSet {
                http: 65_530,
                grpc: 65_531,
                metrics: 65_532,
            })
            .parallelism(2, 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, LaunchError::InvalidSpec(_)));
    }

    #[test]
    fn remote_detection() {
        assert!(is_remote("hdfs:///models"));
        assert!(is_remote("s3a://bucket/key"));
        assert!(!is_remote("file:///models"));
        assert!(!is_remote("/models"));
        assert!(!is_remote("models"));
    }

    #[test]
    fn environment_merges_custom_vars_last() {
        let mut container = ContainerConfig::default();
        container.docker_privileged = true;
        container.docker_mounts = Some("/data:/data:ro".to_string());
        container
            .env
            .insert("YARN_CONTAINER_RUNTIME_DOCKER_RUN_OVERRIDE_DISABLE".to_string(), "false".to_string());
        container.env.insert("HF_HOME".to_string(), "/cache".to_string());

        let env = container_environment("triton:latest", &container, "container_42");
        assert_eq!(env["YARN_CONTAINER_RUNTIME_TYPE"], "docker");
        assert_eq!(env["YARN_CONTAINER_RUNTIME_DOCKER_IMAGE"], "triton:latest");
        assert_eq!(env["YARN_CONTAINER_RUNTIME_DOCKER_CONTAINER_NETWORK"], "host");
        assert_eq!(env["YARN_CONTAINER_RUNTIME_DOCKER_RUN_PRIVILEGED_CONTAINER"], "true");
        assert_eq!(env["YARN_CONTAINER_RUNTIME_DOCKER_MOUNTS"], "/data:/data:ro");
        assert_eq!(env["YARN_CONTAINER_RUNTIME_DOCKER_CONTAINER_HOSTNAME"], "container_42");
        assert_eq!(env["YARN_CONTAINER_RUNTIME_DOCKER_RUN_OVERRIDE_DISABLE"], "false");
        assert_eq!(env["HF_HOME"], "/cache");
        assert!(!env.contains_key("YARN_CONTAINER_RUNTIME_DOCKER_DELAYED_REMOVAL"));
        assert!(!env.contains_key("YARN_CONTAINER_RUNTIME_DOCKER_PORTS_MAPPING"));
    }

    #[test]
    fn plan_from_default_config() {
        let plan = LaunchPlan::from_config(&TarnConfig::default()).unwrap();
        assert!(plan.command.starts_with("mkdir -p /models && hadoop fs -copyToLocal hdfs:///models/* /models && "));
        let ctx = plan.context_for("r-7");
        assert_eq!(ctx.command, plan.command);
        assert_eq!(ctx.env["YARN_CONTAINER_RUNTIME_DOCKER_CONTAINER_HOSTNAME"], "r-7");
    }
}
