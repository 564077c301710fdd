//! Configuration layering: defaults, then the `--config` file, then
//! flags and environment variables.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tarn_core::TarnConfig;

/// Flags shared by every subcommand. Each one overrides the matching
/// field of the TOML file when given.
#[derive(Debug, Default, Args)]
pub struct ConfigArgs {
    /// TOML configuration file.
    #[arg(long, short = 'c', env = "TARN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Model repository (`hdfs:///...` or a local path).
    #[arg(long, env = "MODEL_REPOSITORY")]
    pub model_repository: Option<String>,

    /// Inference server container image.
    #[arg(long, env = "TRITON_IMAGE")]
    pub image: Option<String>,

    #[arg(long, env = "TRITON_PORT")]
    pub http_port: Option<u16>,

    #[arg(long, env = "GRPC_PORT")]
    pub grpc_port: Option<u16>,

    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Port of the discovery and status API.
    #[arg(long, env = "AM_PORT")]
    pub api_port: Option<u16>,

    #[arg(long, env = "BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Token required on every API route but `/health`.
    #[arg(long, env = "TARN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Container memory in MB.
    #[arg(long, env = "CONTAINER_MEMORY")]
    pub memory_mb: Option<u64>,

    #[arg(long, env = "CONTAINER_VCORES")]
    pub vcores: Option<u32>,

    #[arg(long, env = "TENSOR_PARALLELISM")]
    pub tensor_parallelism: Option<u32>,

    #[arg(long, env = "PIPELINE_PARALLELISM")]
    pub pipeline_parallelism: Option<u32>,

    #[arg(long, env = "SECRETS_PATH")]
    pub secrets_path: Option<String>,

    #[arg(long, env = "PLACEMENT_TAG")]
    pub placement_tag: Option<String>,

    #[arg(long, env = "SCALE_UP_THRESHOLD")]
    pub scale_up_threshold: Option<f64>,

    #[arg(long, env = "SCALE_DOWN_THRESHOLD")]
    pub scale_down_threshold: Option<f64>,

    #[arg(long, env = "MIN_CONTAINERS")]
    pub min_replicas: Option<u32>,

    #[arg(long, env = "MAX_CONTAINERS")]
    pub max_replicas: Option<u32>,

    /// Cooldown between scaling changes ("60s", "2m", or bare seconds).
    #[arg(long, env = "SCALE_COOLDOWN")]
    pub cooldown: Option<String>,

    /// Extra container environment, repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,
}

impl ConfigArgs {
    /// Load the file (or defaults), apply overrides, and validate.
    pub fn load(&self) -> anyhow::Result<TarnConfig> {
        let mut config = match &self.config {
            Some(path) => TarnConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TarnConfig::default(),
        };
        self.apply(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn apply(&self, config: &mut TarnConfig) {
        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }

        let server = &mut config.server;
        set(&mut server.model_repository, &self.model_repository);
        set(&mut server.image, &self.image);
        set(&mut server.http_port, &self.http_port);
        set(&mut server.grpc_port, &self.grpc_port);
        set(&mut server.metrics_port, &self.metrics_port);
        set(&mut server.tensor_parallelism, &self.tensor_parallelism);
        set(&mut server.pipeline_parallelism, &self.pipeline_parallelism);
        if let Some(address) = &self.bind_address {
            server.bind_address = address.clone();
            config.api.bind_address = address.clone();
        }
        if self.secrets_path.is_some() {
            server.secrets_path = self.secrets_path.clone();
        }

        let container = &mut config.container;
        set(&mut container.memory_mb, &self.memory_mb);
        set(&mut container.vcores, &self.vcores);
        set(&mut container.placement_tag, &self.placement_tag);
        container.env.extend(self.env.iter().cloned());

        let scaling = &mut config.scaling;
        set(&mut scaling.up_threshold, &self.scale_up_threshold);
        set(&mut scaling.down_threshold, &self.scale_down_threshold);
        set(&mut scaling.min_replicas, &self.min_replicas);
        set(&mut scaling.max_replicas, &self.max_replicas);
        set(&mut scaling.cooldown, &self.cooldown);

        set(&mut config.api.port, &self.api_port);
        if self.token.is_some() {
            config.api.token = self.token.clone();
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_val_parsing() {
        assert_eq!(
            parse_key_val("HF_HOME=/cache=x").unwrap(),
            ("HF_HOME".to_string(), "/cache=x".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=v").is_err());
    }

    #[test]
    fn defaults_without_file_or_flags() {
        let config = ConfigArgs::default().load().unwrap();
        assert_eq!(config, TarnConfig::default());
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tarn.toml");
        std::fs::write(
            &path,
            r#"
[server]
model_repository = "/srv/models"
http_port = 9000

[scaling]
max_replicas = 4
"#,
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(path),
            http_port: Some(9100),
            min_replicas: Some(2),
            bind_address: Some("10.1.2.3".to_string()),
            env: vec![("NCCL_DEBUG".to_string(), "INFO".to_string())],
            ..ConfigArgs::default()
        };
        let config = args.load().unwrap();

        assert_eq!(config.server.model_repository, "/srv/models");
        assert_eq!(config.server.http_port, 9100);
        assert_eq!(config.scaling.min_replicas, 2);
        assert_eq!(config.scaling.max_replicas, 4);
        assert_eq!(config.server.bind_address, "10.1.2.3");
        assert_eq!(config.api.bind_address, "10.1.2.3");
        assert_eq!(config.container.env["NCCL_DEBUG"], "INFO");
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let args = ConfigArgs {
            min_replicas: Some(5),
            max_replicas: Some(2),
            ..ConfigArgs::default()
        };
        let err = args.load().unwrap_err();
        assert!(format!("{err:#}").contains("exceeds"));
    }

    #[test]
    fn missing_file_is_reported() {
        let args = ConfigArgs {
            config: Some(PathBuf::from("/nonexistent/tarn.toml")),
            ..ConfigArgs::default()
        };
        let err = args.load().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tarn.toml"));
    }
}
