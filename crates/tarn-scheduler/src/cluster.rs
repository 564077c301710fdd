//! Interfaces to the cluster allocator and node launcher.
//!
//! Allocator callbacks arrive as [`ClusterEvent`] messages on a channel
//! owned by the controller, so every mutation of the running set happens
//! on the controller's own task.

use std::collections::BTreeMap;
use std::future::Future;

use serde::Serialize;
use tarn_core::{
    NodeId, PlacementConstraint, Replica, ReplicaId, ReplicaPhase, ResourceCapability,
};
use tokio::sync::mpsc;

use crate::error::ClusterResult;

/// One container request, tagged so a grant can be matched back to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub request_id: u64,
    pub capability: ResourceCapability,
    pub placement: PlacementConstraint,
}

/// A container granted by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub replica_id: ReplicaId,
    pub node_id: NodeId,
    pub host: String,
    pub resources: ResourceCapability,
}

impl Allocation {
    pub fn into_replica(self) -> Replica {
        Replica::allocated(self.replica_id, self.node_id, self.host, self.resources)
    }
}

/// Terminal report for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub replica_id: ReplicaId,
    /// `Completed`, `Failed`, or `StoppedByPolicy`.
    pub state: ReplicaPhase,
    pub exit_code: Option<i32>,
    pub diagnostics: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    Allocated(Vec<Allocation>),
    Completed(Vec<Completion>),
    /// The node agent could not start a container it was asked to.
    LaunchFailed { replica_id: ReplicaId, reason: String },
    /// Allocator-side error that does not concern a single container.
    Error(String),
    ResourcesUpdated(ResourceCapability),
    ShutdownRequested,
}

/// Outcome of registering with the allocator.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    /// Containers still alive from a previous controller attempt.
    pub previous_replicas: Vec<Allocation>,
    pub available: ResourceCapability,
}

/// Command and environment for one container launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchContext {
    pub command: String,
    pub env: BTreeMap<String, String>,
}

/// The cluster resource manager as the controller sees it.
pub trait Allocator: Send + Sync + 'static {
    /// Register this controller. Subsequent events go to `events`.
    fn register(
        &self,
        events: mpsc::UnboundedSender<ClusterEvent>,
    ) -> impl Future<Output = ClusterResult<Registration>> + Send;

    /// Ask for one container. The grant arrives later as
    /// [`ClusterEvent::Allocated`].
    fn request_allocation(
        &self,
        request: AllocationRequest,
    ) -> impl Future<Output = ClusterResult<()>> + Send;

    /// Give back a granted container that will not be used.
    fn release(&self, replica_id: &str) -> impl Future<Output = ClusterResult<()>> + Send;

    fn unregister(&self) -> impl Future<Output = ClusterResult<()>> + Send;
}

/// Starts and stops containers on granted nodes.
pub trait Launcher: Send + Sync + 'static {
    fn launch(
        &self,
        replica: &Replica,
        context: &LaunchContext,
    ) -> impl Future<Output = ClusterResult<()>> + Send;

    /// Request a stop. Removal is confirmed later by a completion event.
    fn stop(&self, replica: &Replica) -> impl Future<Output = ClusterResult<()>> + Send;
}
