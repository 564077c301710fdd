//! Domain types shared across Tarn crates.
//!
//! These describe the managed workload as the controller sees it:
//! replicas granted by the cluster allocator, the resources they hold,
//! the placement rule they are requested under, and the alert records
//! surfaced to operators. All types serialize to JSON for the status API.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque cluster-assigned identifier for a replica.
pub type ReplicaId = String;

/// Identifier of a physical node in the cluster.
pub type NodeId = String;

// ── Resources ─────────────────────────────────────────────────────

/// Resources requested for, or granted to, a single replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCapability {
    pub memory_mb: u64,
    pub vcores: u32,
    pub gpus: u32,
}

impl ResourceCapability {
    pub fn new(memory_mb: u64, vcores: u32, gpus: u32) -> Self {
        Self {
            memory_mb,
            vcores,
            gpus,
        }
    }

    /// Whether `other` fits inside this capability.
    pub fn fits(&self, other: &ResourceCapability) -> bool {
        other.memory_mb <= self.memory_mb && other.vcores <= self.vcores && other.gpus <= self.gpus
    }

    pub fn saturating_sub(&self, other: &ResourceCapability) -> Self {
        Self {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            vcores: self.vcores.saturating_sub(other.vcores),
            gpus: self.gpus.saturating_sub(other.gpus),
        }
    }

    pub fn saturating_add(&self, other: &ResourceCapability) -> Self {
        Self {
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            vcores: self.vcores.saturating_add(other.vcores),
            gpus: self.gpus.saturating_add(other.gpus),
        }
    }
}

// ── Placement ─────────────────────────────────────────────────────

/// Placement rule attached to every allocation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlacementConstraint {
    /// At most one replica carrying `tag` per physical node.
    AntiAffinity { tag: String },
}

impl PlacementConstraint {
    pub fn anti_affinity(tag: impl Into<String>) -> Self {
        Self::AntiAffinity { tag: tag.into() }
    }

    /// The allocation tag this constraint is keyed on.
    pub fn tag(&self) -> &str {
        match self {
            Self::AntiAffinity { tag } => tag,
        }
    }
}

// ── Replica ───────────────────────────────────────────────────────

/// Lifecycle phase of a replica.
///
/// `Requested` and `Allocated` exist only inside the controller's
/// bookkeeping; replicas in the running set are `Launching`, `Ready`,
/// or `Stopping`. The last three variants are terminal and only appear
/// in completion reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPhase {
    Requested,
    Allocated,
    Launching,
    Ready,
    Stopping,
    Completed,
    Failed,
    StoppedByPolicy,
}

impl ReplicaPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplicaPhase::Completed | ReplicaPhase::Failed | ReplicaPhase::StoppedByPolicy
        )
    }
}

/// One running unit of the managed workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub node_id: NodeId,
    /// Hostname or address the replica's ports are reachable on.
    pub host: String,
    pub resources: ResourceCapability,
    pub phase: ReplicaPhase,
    /// Unix epoch millis when the launch call succeeded.
    pub launched_at: u64,
    /// Unix epoch millis of the last successful readiness probe.
    pub ready_at: Option<u64>,
}

impl Replica {
    /// A freshly granted replica that has not been launched yet.
    pub fn allocated(
        id: impl Into<ReplicaId>,
        node_id: impl Into<NodeId>,
        host: impl Into<String>,
        resources: ResourceCapability,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            host: host.into(),
            resources,
            phase: ReplicaPhase::Allocated,
            launched_at: 0,
            ready_at: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == ReplicaPhase::Ready
    }

    pub fn is_stopping(&self) -> bool {
        self.phase == ReplicaPhase::Stopping
    }

    /// Milliseconds between launch and first readiness, if known.
    pub fn startup_latency_ms(&self) -> Option<u64> {
        self.ready_at
            .map(|ready| ready.saturating_sub(self.launched_at))
    }
}

// ── Alerts ────────────────────────────────────────────────────────

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scaling or failure event recorded for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Short machine-readable category, e.g. `scaling_event`.
    pub kind: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
