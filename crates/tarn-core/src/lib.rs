//! tarn-core — shared types and configuration for the Tarn controller.
//!
//! Everything here is plain data: replicas, resource capabilities,
//! placement constraints, alerts, and the `tarn.toml` configuration
//! model. No I/O beyond reading the config file.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    AccessRule, ApiConfig, BreakerConfig, ClusterConfig, ContainerConfig, ControllerConfig,
    NodeConfig, RetryConfig, ScalingConfig, ServerConfig, TarnConfig, parse_duration,
};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
