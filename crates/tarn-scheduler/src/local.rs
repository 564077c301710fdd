//! Standalone cluster: allocation over a static node list and launch as
//! local `sh -c` processes.
//!
//! Enforces the same placement rule a real resource manager would (one
//! tagged replica per node, capacity per node), so the controller can
//! run end to end on a workstation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use tarn_core::{ClusterConfig, NodeConfig, Replica, ReplicaId, ReplicaPhase, ResourceCapability};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cluster::{
    Allocation, AllocationRequest, Allocator, ClusterEvent, Completion, LaunchContext, Launcher,
    Registration,
};
use crate::error::{ClusterError, ClusterResult};

#[derive(Debug, Clone)]
struct Placement {
    node: usize,
    tag: String,
    resources: ResourceCapability,
}

#[derive(Default)]
struct LocalState {
    events: Option<mpsc::UnboundedSender<ClusterEvent>>,
    next_id: u64,
    placements: HashMap<ReplicaId, Placement>,
    /// Kill switches for launched processes.
    children: HashMap<ReplicaId, oneshot::Sender<()>>,
}

impl LocalState {
    fn emit(&self, event: ClusterEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn used_on(&self, node: usize) -> ResourceCapability {
        self.placements
            .values()
            .filter(|p| p.node == node)
            .fold(ResourceCapability::default(), |acc, p| acc.saturating_add(&p.resources))
    }

    fn available(&self, nodes: &[NodeConfig]) -> ResourceCapability {
        nodes
            .iter()
            .enumerate()
            .map(|(i, n)| n.capability().saturating_sub(&self.used_on(i)))
            .fold(ResourceCapability::default(), |acc, free| acc.saturating_add(&free))
    }
}

#[derive(Clone)]
pub struct LocalCluster {
    nodes: Arc<Vec<NodeConfig>>,
    log_dir: PathBuf,
    state: Arc<Mutex<LocalState>>,
}

impl LocalCluster {
    pub fn new(nodes: Vec<NodeConfig>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            nodes: Arc::new(nodes),
            log_dir: log_dir.into(),
            state: Arc::new(Mutex::new(LocalState::default())),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.nodes.clone(), &config.log_dir)
    }

    pub fn available(&self) -> ResourceCapability {
        self.lock().available(&self.nodes)
    }

    /// Containers placed and not yet completed.
    pub fn placed(&self) -> usize {
        self.lock().placements.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Free a placement and report the terminal state.
    fn finish(&self, completion: Completion) {
        let mut state = self.lock();
        state.placements.remove(&completion.replica_id);
        state.children.remove(&completion.replica_id);
        let available = state.available(&self.nodes);
        state.emit(ClusterEvent::Completed(vec![completion]));
        state.emit(ClusterEvent::ResourcesUpdated(available));
    }
}

impl Allocator for LocalCluster {
    async fn register(
        &self,
        events: mpsc::UnboundedSender<ClusterEvent>,
    ) -> ClusterResult<Registration> {
        if self.nodes.is_empty() {
            return Err(ClusterError::Registration("no nodes configured".to_string()));
        }
        let mut state = self.lock();
        state.events = Some(events);
        info!(nodes = self.nodes.len(), "local cluster registered");
        Ok(Registration {
            previous_replicas: Vec::new(),
            available: state.available(&self.nodes),
        })
    }

    async fn request_allocation(&self, request: AllocationRequest) -> ClusterResult<()> {
        let mut state = self.lock();
        if state.events.is_none() {
            return Err(ClusterError::NonRetryable("allocator not registered".to_string()));
        }

        let tag = request.placement.tag().to_string();
        let node = (0..self.nodes.len()).find(|&i| {
            let occupied = state.placements.values().any(|p| p.node == i && p.tag == tag);
            let free = self.nodes[i].capability().saturating_sub(&state.used_on(i));
            !occupied && free.fits(&request.capability)
        });
        let Some(node) = node else {
            return Err(ClusterError::AllocationDenied(format!(
                "no node can host {:?} with tag '{tag}'",
                request.capability
            )));
        };

        state.next_id += 1;
        let replica_id = format!("container_{:06}", state.next_id);
        state.placements.insert(
            replica_id.clone(),
            Placement {
                node,
                tag,
                resources: request.capability,
            },
        );
        let node_config = &self.nodes[node];
        debug!(replica = %replica_id, node = %node_config.name, "placed container");

        let allocation = Allocation {
            replica_id,
            node_id: node_config.name.clone(),
            host: node_config.host.clone(),
            resources: request.capability,
        };
        let available = state.available(&self.nodes);
        state.emit(ClusterEvent::Allocated(vec![allocation]));
        state.emit(ClusterEvent::ResourcesUpdated(available));
        Ok(())
    }

    async fn release(&self, replica_id: &str) -> ClusterResult<()> {
        let mut state = self.lock();
        if state.placements.remove(replica_id).is_none() {
            return Err(ClusterError::UnknownReplica(replica_id.to_string()));
        }
        if let Some(kill) = state.children.remove(replica_id) {
            let _ = kill.send(());
        }
        let available = state.available(&self.nodes);
        state.emit(ClusterEvent::ResourcesUpdated(available));
        Ok(())
    }

    async fn unregister(&self) -> ClusterResult<()> {
        let mut state = self.lock();
        for (id, kill) in state.children.drain() {
            debug!(replica = %id, "killing container on unregister");
            let _ = kill.send(());
        }
        state.events = None;
        info!("local cluster unregistered");
        Ok(())
    }
}

async fn log_file(dir: &Path, name: &str) -> ClusterResult<std::fs::File> {
    let path = dir.join(name);
    let file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| ClusterError::NonRetryable(format!("create {}: {e}", path.display())))?;
    Ok(file.into_std().await)
}

impl Launcher for LocalCluster {
    async fn launch(&self, replica: &Replica, context: &LaunchContext) -> ClusterResult<()> {
        if !self.lock().placements.contains_key(&replica.id) {
            return Err(ClusterError::UnknownReplica(replica.id.clone()));
        }

        let dir = self.log_dir.join(&replica.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ClusterError::NonRetryable(format!("create {}: {e}", dir.display())))?;
        let stdout = log_file(&dir, "stdout.log").await?;
        let stderr = log_file(&dir, "stderr.log").await?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&context.command)
            .envs(&context.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterError::NonRetryable(format!("spawn failed: {e}")))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        self.lock().children.insert(replica.id.clone(), kill_tx);
        info!(replica = %replica.id, pid = ?child.id(), logs = %dir.display(), "container started");

        let cluster = self.clone();
        let replica_id = replica.id.clone();
        tokio::spawn(async move {
            let (state, exit_code, diagnostics) = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => (ReplicaPhase::Completed, status.code(), String::new()),
                    Ok(status) => (ReplicaPhase::Failed, status.code(), format!("process {status}")),
                    Err(e) => (ReplicaPhase::Failed, None, format!("wait failed: {e}")),
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(replica = %replica_id, error = %e, "kill failed");
                    }
                    (ReplicaPhase::StoppedByPolicy, None, "stopped".to_string())
                }
            };
            debug!(replica = %replica_id, ?state, ?exit_code, "container exited");
            cluster.finish(Completion {
                replica_id,
                state,
                exit_code,
                diagnostics,
            });
        });
        Ok(())
    }

    async fn stop(&self, replica: &Replica) -> ClusterResult<()> {
        let mut state = self.lock();
        if let Some(kill) = state.children.remove(&replica.id) {
            drop(state);
            let _ = kill.send(());
            return Ok(());
        }
        if !state.placements.contains_key(&replica.id) {
            return Err(ClusterError::UnknownReplica(replica.id.clone()));
        }
        drop(state);

        // Granted but never launched.
        self.finish(Completion {
            replica_id: replica.id.clone(),
            state: ReplicaPhase::StoppedByPolicy,
            exit_code: None,
            diagnostics: "stopped before launch".to_string(),
        });
        Ok(())
    }
}
