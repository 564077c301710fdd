//! tarn-scheduler — the replica-set controller.
//!
//! Keeps a fleet of inference-server containers sized to load:
//! requests containers from the cluster allocator, launches them with a
//! generated server command, replaces ones that die, and moves the
//! target count one step at a time as load crosses the thresholds.
//!
//! # Architecture
//!
//! ```text
//! ReplicaSetController (single task, owns the running set)
//!   ├── ClusterEvent channel ◀── Allocator (grants, completions, errors)
//!   ├── JoinSet ── launch / stop / release via Launcher + Allocator
//!   │              (CircuitBreaker + RetryExecutor around each call)
//!   ├── tick
//!   │     ├── failover: request target - committed, no cooldown
//!   │     ├── ReplicaProbe per replica (own breaker) → LoadAggregator
//!   │     └── ScalingDecider → scale up (request) / down (stop oldest)
//!   └── watch::Sender<ControllerStatus> ──▶ ControllerHandle (readers)
//!
//! LaunchSpecBuilder ── pure: model path + ports + parallelism → command
//! LocalCluster ─────── Allocator + Launcher over a static node list
//! ```

pub mod cluster;
pub mod controller;
pub mod error;
pub mod launch;
pub mod local;

pub use cluster::{
    Allocation, AllocationRequest, Allocator, ClusterEvent, Completion, LaunchContext, Launcher,
    Registration,
};
pub use controller::{ControllerHandle, ControllerSettings, ControllerStatus, ReplicaSetController};
pub use error::{
    ClusterError, ClusterResult, ControllerError, ControllerResult, LaunchError, LaunchResult,
};
pub use launch::{LaunchPlan, LaunchSpecBuilder, PortSet, container_environment};
pub use local::LocalCluster;
