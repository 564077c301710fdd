//! Replica-set controller — the reconcile loop.
//!
//! The controller is an actor: it exclusively owns the running set, the
//! target count, and the outstanding allocation requests. Allocator
//! events, launch and stop results, ticks, and shutdown are all handled
//! on its task, so every size-based decision sees a consistent set.
//! Readers get snapshots through a [`ControllerHandle`].
//!
//! Per tick:
//!
//! 1. expire allocation requests that were never granted, and retry
//!    container releases that failed earlier
//! 2. failover: request containers for any shortfall (no cooldown)
//! 3. probe every active replica, through its own circuit breaker
//! 4. aggregate load, run the scaling decider, act on the new target
//! 5. publish a status snapshot

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tarn_autoscale::{ScalingDecider, ScalingPolicy};
use tarn_core::{
    Alert, PlacementConstraint, Replica, ReplicaId, ReplicaPhase, ResourceCapability, Severity,
    TarnConfig, epoch_millis,
};
use tarn_health::{
    BreakerRegistry, BreakerSettings, BreakerSnapshot, CallError, CircuitBreaker, ProbeError,
    ReplicaProbe, RetryExecutor, RetryPolicy,
};
use tarn_metrics::{LoadAggregator, aggregate_load};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cluster::{
    Allocation, AllocationRequest, Allocator, ClusterEvent, Completion, Launcher,
};
use crate::error::{ClusterError, ClusterResult, ControllerError, ControllerResult};
use crate::launch::LaunchPlan;

/// Breaker key for the allocator channel.
pub const ALLOCATOR_BREAKER: &str = "allocator";
/// Breaker key for the node launcher.
pub const LAUNCHER_BREAKER: &str = "launcher";

// ── Settings ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub policy: ScalingPolicy,
    /// Resources requested per replica.
    pub capability: ResourceCapability,
    pub placement: PlacementConstraint,
    pub tick_interval: Duration,
    /// Requests not granted within this window are dropped and reissued.
    pub allocation_timeout: Duration,
    pub breaker: BreakerSettings,
    pub retry: RetryPolicy,
    pub plan: LaunchPlan,
}

impl ControllerSettings {
    pub fn from_config(config: &TarnConfig) -> ControllerResult<Self> {
        let (initial_delay, max_delay) = config.retry_delays()?;
        let breaker = &config.controller.breaker;
        Ok(Self {
            policy: ScalingPolicy::from_config(config)?,
            capability: config.capability(),
            placement: config.placement(),
            tick_interval: config.tick_interval()?,
            allocation_timeout: config.allocation_timeout()?,
            breaker: BreakerSettings {
                failure_threshold: breaker.failure_threshold,
                reset_timeout: config.breaker_reset_timeout()?,
                half_open_max_probes: breaker.half_open_max_probes,
            },
            retry: RetryPolicy {
                max_retries: config.controller.retry.max_retries,
                initial_delay,
                max_delay,
                multiplier: config.controller.retry.multiplier,
            },
            plan: LaunchPlan::from_config(config)?,
        })
    }
}

// ── Status snapshot ───────────────────────────────────────────────

/// Point-in-time view of the controller, published after every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStatus {
    pub target: u32,
    pub running: Vec<Replica>,
    pub pending_allocations: usize,
    pub launching: usize,
    pub aggregate_load: f64,
    pub available: ResourceCapability,
    pub breakers: Vec<BreakerSnapshot>,
}

impl ControllerStatus {
    pub fn ready_count(&self) -> usize {
        self.running.iter().filter(|r| r.is_ready()).count()
    }

    /// Ready replicas over target, capped at 1.0.
    pub fn progress(&self) -> f64 {
        if self.target == 0 {
            return 1.0;
        }
        (self.ready_count() as f64 / f64::from(self.target)).min(1.0)
    }
}

/// Read-only access to the controller for the HTTP layer.
#[derive(Clone)]
pub struct ControllerHandle {
    status: watch::Receiver<ControllerStatus>,
    aggregator: Arc<LoadAggregator>,
}

impl ControllerHandle {
    /// A handle over any status source, e.g. a fixed snapshot in tests.
    pub fn new(status: watch::Receiver<ControllerStatus>, aggregator: Arc<LoadAggregator>) -> Self {
        Self { status, aggregator }
    }

    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    pub fn running_replicas(&self) -> Vec<Replica> {
        self.status.borrow().running.clone()
    }

    pub fn target(&self) -> u32 {
        self.status.borrow().target
    }

    pub fn available_resources(&self) -> ResourceCapability {
        self.status.borrow().available
    }

    pub fn aggregate_load(&self) -> f64 {
        self.status.borrow().aggregate_load
    }

    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.aggregator.recent_alerts()
    }

    pub fn aggregator(&self) -> &Arc<LoadAggregator> {
        &self.aggregator
    }

    /// Wait for the next published snapshot.
    pub async fn changed(&mut self) -> bool {
        self.status.changed().await.is_ok()
    }
}

// ── Background task results ───────────────────────────────────────

#[derive(Debug)]
enum TaskOutcome {
    Launched {
        replica: Replica,
        result: ClusterResult<()>,
    },
    Stopped {
        replica_id: ReplicaId,
        result: ClusterResult<()>,
    },
    Released {
        replica_id: ReplicaId,
        result: ClusterResult<()>,
    },
}

struct ReplicaSample {
    replica_id: ReplicaId,
    host: String,
    ready: bool,
    metrics: Result<String, CallError<ProbeError>>,
}

// ── Controller ────────────────────────────────────────────────────

pub struct ReplicaSetController<A, L, P> {
    settings: ControllerSettings,
    allocator: Arc<A>,
    launcher: Arc<L>,
    probe: Arc<P>,
    aggregator: Arc<LoadAggregator>,
    breakers: Arc<BreakerRegistry>,
    decider: ScalingDecider,
    retry: RetryExecutor,

    target: u32,
    /// Launched replicas, oldest first.
    running: Vec<Replica>,
    /// Granted containers whose launch call is in flight.
    launching: HashMap<ReplicaId, Replica>,
    /// Outstanding allocation requests, oldest first.
    pending: VecDeque<(u64, Instant)>,
    /// Containers that completed while their launch was in flight.
    tombstones: HashSet<ReplicaId>,
    /// Containers whose release failed; retried every tick.
    unreleased: HashSet<ReplicaId>,
    next_request_id: u64,
    available: ResourceCapability,
    aggregate_load: f64,

    events_tx: mpsc::UnboundedSender<ClusterEvent>,
    events_rx: mpsc::UnboundedReceiver<ClusterEvent>,
    tasks: JoinSet<TaskOutcome>,
    status_tx: watch::Sender<ControllerStatus>,
    shutdown_requested: bool,
}

impl<A, L, P> ReplicaSetController<A, L, P>
where
    A: Allocator,
    L: Launcher,
    P: ReplicaProbe,
{
    pub fn new(settings: ControllerSettings, allocator: Arc<A>, launcher: Arc<L>, probe: Arc<P>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ControllerStatus::default());
        let target = settings.policy.min;
        Self {
            decider: ScalingDecider::new(settings.policy),
            retry: RetryExecutor::new(settings.retry),
            breakers: Arc::new(BreakerRegistry::new(settings.breaker)),
            aggregator: Arc::new(LoadAggregator::new()),
            settings,
            allocator,
            launcher,
            probe,
            target,
            running: Vec::new(),
            launching: HashMap::new(),
            pending: VecDeque::new(),
            tombstones: HashSet::new(),
            unreleased: HashSet::new(),
            next_request_id: 0,
            available: ResourceCapability::default(),
            aggregate_load: 0.0,
            events_tx,
            events_rx,
            tasks: JoinSet::new(),
            status_tx,
            shutdown_requested: false,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            status: self.status_tx.subscribe(),
            aggregator: Arc::clone(&self.aggregator),
        }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn running(&self) -> &[Replica] {
        &self.running
    }

    pub fn pending_allocations(&self) -> usize {
        self.pending.len()
    }

    pub fn aggregator(&self) -> &Arc<LoadAggregator> {
        &self.aggregator
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Register with the allocator, adopt containers from a previous
    /// attempt, and request the initial shortfall.
    ///
    /// Registration failure is the only error that stops the controller.
    pub async fn start(&mut self) -> ControllerResult<()> {
        let events = self.events_tx.clone();
        let registration = self
            .retry
            .execute(
                "register",
                || self.allocator.register(events.clone()),
                ClusterError::is_transient,
            )
            .await
            .map_err(|e| ControllerError::Registration(e.into()))?;

        self.available = registration.available;
        for allocation in registration.previous_replicas {
            if self.is_known(&allocation.replica_id) {
                continue;
            }
            let mut replica = allocation.into_replica();
            replica.phase = ReplicaPhase::Launching;
            replica.launched_at = epoch_millis();
            self.aggregator.record_start(&replica.id, replica.launched_at).await;
            self.running.push(replica);
        }

        let recovered = u32::try_from(self.running.len()).unwrap_or(u32::MAX);
        let policy = self.decider.policy();
        self.target = policy.clamp(policy.min.max(recovered));
        info!(
            recovered,
            target = self.target,
            available_gpus = self.available.gpus,
            "registered with cluster allocator"
        );

        self.request_missing().await;
        self.publish();
        Ok(())
    }

    /// Register, then reconcile until `shutdown` turns `true` or the
    /// allocator asks the controller to exit.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ControllerResult<()> {
        self.retry = self.retry.clone().with_cancel(shutdown.clone());
        self.start().await?;

        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; start() already reconciled.
        interval.tick().await;

        info!(interval = ?self.settings.tick_interval, "controller running");
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.on_task(joined).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if self.shutdown_requested {
                info!("allocator requested shutdown");
                break;
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One reconcile pass.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        self.expire_pending(now);
        self.retry_releases();
        self.request_missing().await;

        let loads = self.sample_replicas().await;
        let load = aggregate_load(&loads);
        self.aggregate_load = load;

        let current = self.target;
        let next = self.decider.decide(current, load, now);
        if next > current {
            self.target = next;
            self.aggregator.record_scaling_event("Scale up", current, next);
            self.request_missing().await;
        } else if next < current {
            self.target = next;
            self.aggregator.record_scaling_event("Scale down", current, next);
            self.stop_oldest();
        } else if self.active_count() > self.target as usize && !self.any_stopping() {
            // A failed stop left the set above target.
            self.stop_oldest();
        }

        debug!(
            target = self.target,
            running = self.running.len(),
            pending = self.pending.len(),
            load,
            "reconcile tick complete"
        );
        self.publish();
    }

    pub async fn handle_event(&mut self, event: ClusterEvent) {
        match event {
            ClusterEvent::Allocated(allocations) => {
                for allocation in allocations {
                    self.on_allocated(allocation);
                }
            }
            ClusterEvent::Completed(completions) => {
                for completion in completions {
                    self.on_completed(completion).await;
                }
            }
            ClusterEvent::LaunchFailed { replica_id, reason } => {
                warn!(replica = %replica_id, %reason, "node agent failed to start container");
                self.on_completed(Completion {
                    replica_id: replica_id.clone(),
                    state: ReplicaPhase::Failed,
                    exit_code: None,
                    diagnostics: reason,
                })
                .await;
                self.spawn_release(replica_id);
            }
            ClusterEvent::Error(message) => {
                self.aggregator
                    .record_alert("allocator_error", message, Severity::Warning);
            }
            ClusterEvent::ResourcesUpdated(available) => {
                self.available = available;
            }
            ClusterEvent::ShutdownRequested => {
                self.shutdown_requested = true;
            }
        }
        self.publish();
    }

    /// Process queued events and wait for every background task.
    pub async fn settle(&mut self) {
        loop {
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event).await;
            }
            match self.tasks.join_next().await {
                Some(joined) => self.on_task(joined).await,
                None if self.events_rx.is_empty() => break,
                None => {}
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("controller shutting down");
        self.tasks.shutdown().await;
        if let Err(e) = self.allocator.unregister().await {
            warn!(error = %e, "failed to unregister from allocator");
        }
        self.publish();
    }

    // ── Allocation ────────────────────────────────────────────────

    /// Non-stopping replicas in the running set.
    fn active_count(&self) -> usize {
        self.running.iter().filter(|r| !r.is_stopping()).count()
    }

    fn any_stopping(&self) -> bool {
        self.running.iter().any(Replica::is_stopping)
    }

    /// Replicas running, being launched, or requested.
    fn committed(&self) -> usize {
        self.active_count() + self.launching.len() + self.pending.len()
    }

    fn is_known(&self, replica_id: &str) -> bool {
        self.launching.contains_key(replica_id) || self.running.iter().any(|r| r.id == replica_id)
    }

    /// Issue allocation requests for `target - committed`.
    async fn request_missing(&mut self) {
        let needed = (self.target as usize).saturating_sub(self.committed());
        if needed == 0 {
            return;
        }

        let breaker = self.breakers.get_or_create(ALLOCATOR_BREAKER);
        let mut issued = 0;
        for _ in 0..needed {
            let request = AllocationRequest {
                request_id: self.next_request_id,
                capability: self.settings.capability,
                placement: self.settings.placement.clone(),
            };
            self.next_request_id += 1;

            let allocator = &self.allocator;
            let result = guarded(&breaker, &self.retry, "request_allocation", || {
                allocator.request_allocation(request.clone())
            })
            .await;

            match result {
                Ok(()) => {
                    self.pending.push_back((request.request_id, Instant::now()));
                    issued += 1;
                }
                Err(ClusterError::AllocationDenied(reason)) => {
                    warn!(%reason, "allocation denied, will retry next tick");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "allocation request failed");
                    break;
                }
            }
        }
        if issued > 0 {
            info!(issued, needed, target = self.target, "requested containers");
        }
    }

    fn expire_pending(&mut self, now: Instant) {
        while let Some(&(request_id, at)) = self.pending.front() {
            if now.saturating_duration_since(at) < self.settings.allocation_timeout {
                break;
            }
            self.pending.pop_front();
            warn!(request_id, "allocation request expired");
        }
    }

    fn on_allocated(&mut self, allocation: Allocation) {
        if self.is_known(&allocation.replica_id) {
            debug!(replica = %allocation.replica_id, "duplicate allocation ignored");
            return;
        }
        self.pending.pop_front();
        if self.active_count() + self.launching.len() >= self.target as usize {
            info!(replica = %allocation.replica_id, "surplus allocation, releasing");
            self.spawn_release(allocation.replica_id);
            return;
        }

        let replica = allocation.into_replica();
        info!(replica = %replica.id, host = %replica.host, "container allocated, launching");
        self.launching.insert(replica.id.clone(), replica.clone());

        let context = self.settings.plan.context_for(&replica.id);
        let launcher = Arc::clone(&self.launcher);
        let breaker = self.breakers.get_or_create(LAUNCHER_BREAKER);
        let retry = self.retry.clone();
        self.tasks.spawn(async move {
            let result = guarded(&breaker, &retry, "launch", || launcher.launch(&replica, &context)).await;
            TaskOutcome::Launched { replica, result }
        });
    }

    async fn on_completed(&mut self, completion: Completion) {
        let id = completion.replica_id;
        if self.launching.contains_key(&id) {
            debug!(replica = %id, "completion for a launch in flight");
            self.tombstones.insert(id);
            return;
        }
        let Some(index) = self.running.iter().position(|r| r.id == id) else {
            debug!(replica = %id, "completion for unknown replica ignored");
            return;
        };

        let replica = self.running.remove(index);
        self.breakers.remove(&id);
        self.aggregator.forget_replica(&id).await;

        if replica.is_stopping() {
            info!(replica = %id, state = ?completion.state, "replica stopped");
            return;
        }

        let reason = match (completion.exit_code, completion.diagnostics.is_empty()) {
            (_, false) => completion.diagnostics,
            (Some(code), true) => format!("exit code {code}"),
            (None, true) => format!("{:?}", completion.state),
        };
        self.aggregator.record_replica_failure(&id, &reason);
        // Replacing a lost replica is not scaling; no cooldown applies.
        self.request_missing().await;
    }

    // ── Background task results ───────────────────────────────────

    async fn on_task(&mut self, joined: Result<TaskOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "controller task did not complete");
                return;
            }
        };

        match outcome {
            TaskOutcome::Launched { mut replica, result } => {
                self.launching.remove(&replica.id);
                if self.tombstones.remove(&replica.id) {
                    debug!(replica = %replica.id, "launched replica already completed, discarding");
                    return;
                }
                match result {
                    Ok(()) => {
                        replica.phase = ReplicaPhase::Launching;
                        replica.launched_at = epoch_millis();
                        self.aggregator.record_start(&replica.id, replica.launched_at).await;
                        info!(replica = %replica.id, "replica launched");
                        self.running.push(replica);
                    }
                    Err(e) => {
                        self.aggregator
                            .record_replica_failure(&replica.id, &format!("launch failed: {e}"));
                        self.spawn_release(replica.id);
                    }
                }
            }
            TaskOutcome::Stopped { replica_id, result } => {
                if let Err(e) = result {
                    warn!(replica = %replica_id, error = %e, "stop failed");
                    if let Some(replica) = self.running.iter_mut().find(|r| r.id == replica_id) {
                        replica.phase = if replica.ready_at.is_some() {
                            ReplicaPhase::Ready
                        } else {
                            ReplicaPhase::Launching
                        };
                    }
                }
            }
            TaskOutcome::Released { replica_id, result } => match result {
                Ok(()) => debug!(replica = %replica_id, "container released"),
                Err(ClusterError::UnknownReplica(_)) => {
                    debug!(replica = %replica_id, "allocator no longer knows container");
                }
                Err(e) => {
                    warn!(replica = %replica_id, error = %e, "release failed, will retry next tick");
                    self.unreleased.insert(replica_id);
                }
            },
        }
        self.publish();
    }

    // ── Stop / release ────────────────────────────────────────────

    /// Mark the oldest active replica `Stopping` and ask the launcher to
    /// stop it. It leaves the set only when its completion arrives.
    fn stop_oldest(&mut self) {
        let Some(replica) = self.running.iter_mut().find(|r| !r.is_stopping()) else {
            return;
        };
        replica.phase = ReplicaPhase::Stopping;
        let replica = replica.clone();
        info!(replica = %replica.id, "stopping replica");

        let launcher = Arc::clone(&self.launcher);
        let breaker = self.breakers.get_or_create(LAUNCHER_BREAKER);
        let retry = self.retry.clone();
        self.tasks.spawn(async move {
            let result = guarded(&breaker, &retry, "stop", || launcher.stop(&replica)).await;
            TaskOutcome::Stopped {
                replica_id: replica.id,
                result,
            }
        });
    }

    /// Hand a container back to the allocator. Releases skip the
    /// allocator breaker: a denied request must not strand a granted GPU.
    fn spawn_release(&mut self, replica_id: ReplicaId) {
        let allocator = Arc::clone(&self.allocator);
        let retry = self.retry.clone();
        self.tasks.spawn(async move {
            let result = retry
                .execute("release", || allocator.release(&replica_id), ClusterError::is_transient)
                .await
                .map_err(ClusterError::from);
            TaskOutcome::Released { replica_id, result }
        });
    }

    fn retry_releases(&mut self) {
        let failed: Vec<_> = self.unreleased.drain().collect();
        for replica_id in failed {
            info!(replica = %replica_id, "retrying container release");
            self.spawn_release(replica_id);
        }
    }

    // ── Sampling ──────────────────────────────────────────────────

    /// Probe every active replica concurrently. One load per replica;
    /// a replica without a metrics sample contributes 0.
    async fn sample_replicas(&mut self) -> Vec<f64> {
        let mut probes = JoinSet::new();
        for replica in self.running.iter().filter(|r| !r.is_stopping()).cloned() {
            let probe = Arc::clone(&self.probe);
            let breaker = self.breakers.get_or_create(&replica.id);
            probes.spawn(async move {
                let ready = if replica.is_ready() {
                    true
                } else {
                    match probe.ready(&replica).await {
                        Ok(ready) => ready,
                        Err(e) => {
                            debug!(replica = %replica.id, error = %e, "readiness probe failed");
                            false
                        }
                    }
                };
                let metrics = breaker.try_execute(|| probe.metrics(&replica)).await;
                ReplicaSample {
                    replica_id: replica.id,
                    host: replica.host,
                    ready,
                    metrics,
                }
            });
        }

        let mut loads = Vec::with_capacity(probes.len());
        while let Some(joined) = probes.join_next().await {
            let sample = match joined {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(error = %e, "probe task did not complete");
                    loads.push(0.0);
                    continue;
                }
            };

            if sample.ready {
                self.mark_ready(&sample.replica_id).await;
            }
            let load = match sample.metrics {
                Ok(text) => {
                    self.aggregator
                        .ingest(&sample.replica_id, &sample.host, &text)
                        .await
                }
                Err(e) => {
                    debug!(replica = %sample.replica_id, error = %e, "no metrics sample");
                    self.aggregator
                        .record_unavailable(&sample.replica_id, &sample.host)
                        .await;
                    0.0
                }
            };
            loads.push(load);
        }
        loads
    }

    async fn mark_ready(&mut self, replica_id: &str) {
        let Some(replica) = self.running.iter_mut().find(|r| r.id == replica_id) else {
            return;
        };
        if replica.is_ready() || replica.is_stopping() {
            return;
        }
        let now = epoch_millis();
        replica.phase = ReplicaPhase::Ready;
        replica.ready_at = Some(now);
        info!(replica = %replica_id, startup_ms = ?replica.startup_latency_ms(), "replica ready");
        self.aggregator.record_ready(replica_id, now).await;
    }

    fn publish(&self) {
        self.status_tx.send_replace(ControllerStatus {
            target: self.target,
            running: self.running.clone(),
            pending_allocations: self.pending.len(),
            launching: self.launching.len(),
            aggregate_load: self.aggregate_load,
            available: self.available,
            breakers: self.breakers.snapshot(),
        });
    }
}

/// Run a cluster call through `breaker`, retrying transient failures.
async fn guarded<T, F, Fut>(
    breaker: &CircuitBreaker,
    retry: &RetryExecutor,
    operation: &str,
    op: F,
) -> ClusterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClusterResult<T>>,
{
    breaker
        .try_execute(|| retry.execute(operation, op, ClusterError::is_transient))
        .await
        .map_err(ClusterError::from)
}
