//! Operation Reconciler
//!
//! Drives every registered operation to a terminal status against the
//! operation backend. Each operation is polled on its own exponential
//! backoff schedule; completions are applied to the capacity model, written
//! to the store and, for deletes, release the protective marker.

use super::capacity::{CapacityModel, LifecycleState};
use super::finalizer::{DeletionConfirmed, FinalizerGuard};
use super::identity::{InstanceHandle, ResourceKey};
use super::operations::{
    Intent, Operation, OperationId, OperationRegistry, OperationStatus, OperationType,
};
use super::persist::StateWriter;
use crate::domain::ports::OperationBackend;
use crate::error::{Error, ErrorAction, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Reconciler tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerConfig {
    /// First poll delay in milliseconds
    pub initial_poll_ms: u64,
    /// Poll delay ceiling in seconds
    pub max_poll_secs: u64,
    pub multiplier: f64,
    /// Randomization factor applied to each delay
    pub jitter: f64,
    /// Running longer than this is treated as unknown
    pub running_ceiling_secs: u64,
    /// Unknown longer than this fails the operation
    pub unknown_grace_secs: u64,
    /// Loop period in milliseconds
    pub tick_ms: u64,
    /// Delete instances whose last share went away
    pub reclaim_empty_instances: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            initial_poll_ms: 2_000,
            max_poll_secs: 60,
            multiplier: 2.0,
            jitter: 0.3,
            running_ceiling_secs: 2 * 60 * 60,
            unknown_grace_secs: 10 * 60,
            tick_ms: 1_000,
            reclaim_empty_instances: true,
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_poll_ms == 0 || self.tick_ms == 0 {
            return Err(Error::Configuration(
                "reconciler intervals must be positive".into(),
            ));
        }
        if self.initial_poll_ms > self.max_poll_secs * 1_000 {
            return Err(Error::Configuration(format!(
                "initial poll {}ms exceeds max poll {}s",
                self.initial_poll_ms, self.max_poll_secs
            )));
        }
        if self.multiplier < 1.0 {
            return Err(Error::Configuration(format!(
                "backoff multiplier {} must be at least 1",
                self.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::Configuration(format!(
                "jitter {} must be in [0, 1)",
                self.jitter
            )));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    fn running_ceiling(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.running_ceiling_secs as i64)
    }

    fn unknown_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.unknown_grace_secs as i64)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_poll_ms))
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.jitter)
            .with_max_interval(Duration::from_secs(self.max_poll_secs))
            .with_max_elapsed_time(None)
            .build()
    }
}

// =============================================================================
// Report
// =============================================================================

/// What one reconcile pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: usize,
    pub polled: usize,
    pub succeeded: Vec<OperationType>,
    pub failed: Vec<OperationType>,
    pub unknown: usize,
    pub backend_errors: usize,
    pub evicted: usize,
    pub reclaimed: usize,
}

impl ReconcileReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

// =============================================================================
// Operation Reconciler
// =============================================================================

struct PollState {
    backoff: ExponentialBackoff,
    next_due: DateTime<Utc>,
}

/// Polls and completes registered operations
pub struct OperationReconciler {
    config: ReconcilerConfig,
    registry: Arc<OperationRegistry>,
    model: Arc<CapacityModel>,
    backend: Arc<dyn OperationBackend>,
    writer: Arc<StateWriter>,
    guard: Arc<FinalizerGuard>,
    schedule: Mutex<HashMap<OperationId, PollState>>,
}

impl OperationReconciler {
    pub fn new(
        config: ReconcilerConfig,
        registry: Arc<OperationRegistry>,
        model: Arc<CapacityModel>,
        backend: Arc<dyn OperationBackend>,
        writer: Arc<StateWriter>,
        guard: Arc<FinalizerGuard>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            model,
            backend,
            writer,
            guard,
            schedule: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn is_due(&self, id: OperationId, now: DateTime<Utc>) -> bool {
        self.schedule
            .lock()
            .get(&id)
            .map_or(true, |state| now >= state.next_due)
    }

    /// Push the next poll of `id` out by its next backoff interval
    fn defer(&self, id: OperationId, now: DateTime<Utc>) {
        let mut schedule = self.schedule.lock();
        let state = schedule.entry(id).or_insert_with(|| PollState {
            backoff: self.config.backoff(),
            next_due: now,
        });
        let wait = state
            .backoff
            .next_backoff()
            .unwrap_or(Duration::from_secs(self.config.max_poll_secs));
        // Millisecond resolution keeps schedules stable without jitter
        state.next_due = now + chrono::Duration::milliseconds(wait.as_millis() as i64);
    }

    /// Reschedule `id` after a failed pass, honoring the error's own delay
    fn defer_after(&self, id: OperationId, now: DateTime<Utc>, err: &Error) {
        let ErrorAction::RequeueAfter(wait) = err.action() else {
            return self.defer(id, now);
        };
        let mut schedule = self.schedule.lock();
        let state = schedule.entry(id).or_insert_with(|| PollState {
            backoff: self.config.backoff(),
            next_due: now,
        });
        state.next_due = now + chrono::Duration::milliseconds(wait.as_millis() as i64);
    }

    /// When `id` is next due for a poll, if scheduled
    pub fn next_due(&self, id: OperationId) -> Option<DateTime<Utc>> {
        self.schedule.lock().get(&id).map(|s| s.next_due)
    }

    /// Run one pass over every due operation
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for op in self.registry.evict_expired(now) {
            report.evicted += 1;
            if let Err(e) = self.forget_operation(&op.target).await {
                warn!("Failed to clear evicted {} for {}: {}", op.id, op.target, e);
            }
        }

        let mut active = HashSet::new();
        for op in self.registry.list_active() {
            active.insert(op.id);
            if !self.is_due(op.id, now) {
                continue;
            }
            if let Err(e) = self.drive(&op, now, &mut report).await {
                report.backend_errors += 1;
                warn!(
                    "Reconciling {} {} on {} failed: {}",
                    op.id, op.op_type, op.target, e
                );
                self.defer_after(op.id, now, &e);
            }
        }

        if self.config.reclaim_empty_instances {
            self.reclaim_empty(now, &mut report).await;
        }

        self.schedule.lock().retain(|id, _| active.contains(id));
        report
    }

    /// Loop on the configured tick until cancelled
    pub async fn run<F>(&self, cancel: CancellationToken, mut on_report: F)
    where
        F: FnMut(&ReconcileReport) + Send,
    {
        info!("Operation reconciler started (tick {:?})", self.config.tick());
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Operation reconciler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.reconcile_once(Utc::now()).await;
                    if !report.is_idle() {
                        debug!("Reconcile pass: {:?}", report);
                    }
                    on_report(&report);
                }
            }
        }
    }

    async fn drive(&self, op: &Operation, now: DateTime<Utc>, report: &mut ReconcileReport) -> Result<()> {
        if op.completing {
            return self.complete(op, now, report).await;
        }

        if let Some(since) = op.unknown_since {
            if now - since > self.config.unknown_grace() {
                let reason = Error::UnknownState {
                    resource: op.target.to_string(),
                    detail: format!("no definite status since {}", since),
                };
                return self.fail(op, reason.to_string(), now, report).await;
            }
        }

        let Some(name) = op.backend_name.clone() else {
            let name = match self.backend.start(&op.intent()).await {
                Ok(name) => name,
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => return self.fail(op, e.to_string(), now, report).await,
            };
            info!("Started {} {} on {} as {}", op.id, op.op_type, op.target, name);
            self.registry.mark_started(op.id, name, now);
            self.writer.operation(op.id).await?;
            report.started += 1;
            self.defer(op.id, now);
            return Ok(());
        };

        report.polled += 1;
        let poll = self.backend.poll(&name).await?;
        debug!("Polled {} ({}): {}", op.id, name, poll.status);

        let status = match poll.status {
            OperationStatus::Running if now - op.start_time > self.config.running_ceiling() => {
                warn!(
                    "{} {} on {} still running after {}s",
                    op.id, op.op_type, op.target, self.config.running_ceiling_secs
                );
                OperationStatus::Unknown
            }
            other => other,
        };

        if status == OperationStatus::Succeeded {
            let op = self.registry.mark_completing(op.id, now)?;
            return self.complete(&op, now, report).await;
        }

        let observed = self.registry.observe(op.id, status, poll.error, now)?;
        match observed.operation.status {
            OperationStatus::Failed => {
                report.failed.push(op.op_type);
                self.apply_failure(&observed.operation).await?;
            }
            OperationStatus::Unknown => {
                report.unknown += 1;
                self.writer.operation(op.id).await?;
                self.defer(op.id, now);
            }
            _ => self.defer(op.id, now),
        }
        Ok(())
    }

    async fn fail(
        &self,
        op: &Operation,
        reason: String,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let observed = self
            .registry
            .observe(op.id, OperationStatus::Failed, Some(reason), now)?;
        report.failed.push(op.op_type);
        self.apply_failure(&observed.operation).await
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    /// Apply a backend success, then settle the operation
    ///
    /// A failed write leaves the operation completing with its claims held,
    /// and the next due pass repeats every step.
    async fn complete(&self, op: &Operation, now: DateTime<Utc>, report: &mut ReconcileReport) -> Result<()> {
        self.apply_success(op).await?;
        let observed = self.registry.observe(op.id, OperationStatus::Succeeded, None, now)?;
        report.succeeded.push(op.op_type);

        // Drop the finished operation from the target's record
        if let Err(e) = self.writer.resource(&op.target).await {
            warn!("Failed to persist {} after {}: {}", op.target, op.id, e);
        }
        if let Some(next) = observed.follow_up {
            if let Err(e) = self.writer.operation(next).await {
                warn!("Failed to persist follow-up {} of {}: {}", next, op.id, e);
            }
        }
        Ok(())
    }

    async fn apply_success(&self, op: &Operation) -> Result<()> {
        match (&op.target, op.op_type) {
            (ResourceKey::Instance(h), OperationType::InstanceCreate) => {
                self.model.set_instance_state(h, LifecycleState::Ready)?;
                self.writer.instance(h).await?;
            }
            (ResourceKey::Instance(h), OperationType::InstanceUpdate) => {
                self.model.resize_instance(h, op.capacity_bytes)?;
                self.model.set_instance_state(h, LifecycleState::Ready)?;
                self.writer.instance(h).await?;
            }
            (ResourceKey::Instance(h), OperationType::InstanceDelete) => {
                if self.model.contains_instance(h) {
                    self.model.set_instance_state(h, LifecycleState::Deleted)?;
                }
                self.confirm_deletion(op).await?;
                self.writer.store().remove_instance(h).await?;
                if self.model.contains_instance(h) {
                    self.model.remove_instance(h)?;
                }
                info!("Instance {} deleted", h);
            }
            (ResourceKey::Share(s), OperationType::ShareCreate) => {
                self.model.attach_share(s, op.capacity_bytes)?;
                self.model.set_share_state(s, LifecycleState::Ready)?;
                self.writer.share(s).await?;
                self.writer.instance(&s.instance).await?;
            }
            (ResourceKey::Share(s), OperationType::ShareUpdate) => {
                self.model.resize_share(s, op.capacity_bytes)?;
                self.model.set_share_state(s, LifecycleState::Ready)?;
                self.writer.share(s).await?;
            }
            (ResourceKey::Share(s), OperationType::ShareDelete) => {
                self.model.detach_share(s)?;
                if self.model.share(s).is_some() {
                    self.model.set_share_state(s, LifecycleState::Deleted)?;
                }
                self.confirm_deletion(op).await?;
                self.writer.store().remove_share(s).await?;
                self.model.remove_share(s);
                self.writer.instance(&s.instance).await?;
                info!("Share {} deleted", s);
            }
            (target, op_type) => {
                return Err(Error::UnknownState {
                    resource: target.to_string(),
                    detail: format!("cannot apply {} to this resource", op_type),
                })
            }
        }
        Ok(())
    }

    async fn confirm_deletion(&self, op: &Operation) -> Result<()> {
        let confirmed = DeletionConfirmed::from_operation(op).ok_or_else(|| {
            Error::Internal(format!("{} is not a completed delete", op.id))
        })?;
        self.guard.release(&confirmed).await
    }

    async fn apply_failure(&self, op: &Operation) -> Result<()> {
        error!(
            "{} {} on {} failed: {}",
            op.id,
            op.op_type,
            op.target,
            op.error.as_deref().unwrap_or("no detail")
        );
        self.settle_failed(&op.target, op.op_type).await?;

        // The chain never runs; its targets must not stay pending forever
        let mut next = op.then.as_deref();
        while let Some(intent) = next {
            self.settle_failed(&intent.target, intent.op_type).await?;
            next = intent.then.as_deref();
        }
        Ok(())
    }

    async fn settle_failed(&self, target: &ResourceKey, op_type: OperationType) -> Result<()> {
        let state = match op_type {
            OperationType::InstanceUpdate | OperationType::ShareUpdate => LifecycleState::Ready,
            _ => LifecycleState::Error,
        };
        let applied = match target {
            ResourceKey::Instance(h) => self.model.set_instance_state(h, state),
            ResourceKey::Share(s) => self.model.set_share_state(s, state),
        };
        match applied {
            Ok(_) => self.writer.resource(target).await,
            Err(Error::ResourceNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Register deletes for instances with nothing left on them
    ///
    /// Ready instances qualify at once. Instances left in error by a failed
    /// create qualify once that failure has been evicted.
    async fn reclaim_empty(&self, now: DateTime<Utc>, report: &mut ReconcileReport) {
        let occupied: HashSet<InstanceHandle> = self
            .model
            .shares()
            .into_iter()
            .map(|s| s.handle.instance)
            .collect();

        for entry in self.model.instances() {
            let key = ResourceKey::Instance(entry.handle.clone());
            let eligible = match entry.state {
                LifecycleState::Ready => true,
                LifecycleState::Error => self.registry.failed_for(&key).is_none(),
                _ => false,
            };
            if !eligible
                || !entry.shares.is_empty()
                || occupied.contains(&entry.handle)
                || self.registry.is_busy(&key)
            {
                continue;
            }
            match self.reclaim(&entry.handle, entry.total_capacity, now).await {
                Ok(true) => report.reclaimed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to reclaim empty instance {}: {}", entry.handle, e),
            }
        }
    }

    async fn reclaim(&self, handle: &InstanceHandle, capacity: u64, now: DateTime<Utc>) -> Result<bool> {
        let intent = Intent::new(handle.clone(), OperationType::InstanceDelete, capacity);
        let id = match self.registry.register(intent, now) {
            Ok(id) => id,
            Err(Error::Conflict { .. }) => {
                debug!("Instance {} is busy, not reclaiming", handle);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        info!("Reclaiming empty instance {}", handle);
        self.model.set_instance_state(handle, LifecycleState::Deleting)?;
        self.writer.instance(handle).await?;
        self.writer.operation(id).await?;
        Ok(true)
    }

    /// Rewrite a resource after its retained failure was evicted
    async fn forget_operation(&self, target: &ResourceKey) -> Result<()> {
        let known = match target {
            ResourceKey::Instance(h) => self.model.contains_instance(h),
            ResourceKey::Share(s) => self.model.share(s).is_some(),
        };
        if known {
            self.writer.resource(target).await
        } else {
            match self.writer.store().remove_operation(target).await {
                Err(Error::ResourceNotFound { .. }) => Ok(()),
                other => other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{InMemoryFilestore, MemoryStore};
    use crate::domain::ports::ResourceStore;
    use crate::multishare::capacity::{InstanceEntry, ShareEntry};
    use crate::multishare::constraints::{Constraints, GIB, TIB};
    use crate::multishare::identity::ShareHandle;

    struct Harness {
        registry: Arc<OperationRegistry>,
        model: Arc<CapacityModel>,
        store: Arc<MemoryStore>,
        backend: Arc<InMemoryFilestore>,
        reconciler: Arc<OperationReconciler>,
    }

    fn harness(polls: u32) -> Harness {
        harness_with(
            polls,
            ReconcilerConfig {
                jitter: 0.0,
                ..ReconcilerConfig::default()
            },
        )
    }

    fn harness_with(polls: u32, config: ReconcilerConfig) -> Harness {
        let registry = Arc::new(OperationRegistry::new());
        let model = CapacityModel::new(Constraints::default());
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(InMemoryFilestore::new(polls));
        let dyn_store: Arc<dyn ResourceStore> = store.clone();
        let writer = Arc::new(StateWriter::new(dyn_store.clone(), model.clone(), registry.clone()));
        let guard = Arc::new(FinalizerGuard::new(dyn_store, model.clone()));
        let reconciler = OperationReconciler::new(
            config,
            registry.clone(),
            model.clone(),
            backend.clone(),
            writer,
            guard,
        );
        Harness {
            registry,
            model,
            store,
            backend,
            reconciler,
        }
    }

    fn secs(t: DateTime<Utc>, s: i64) -> DateTime<Utc> {
        t + chrono::Duration::seconds(s)
    }

    async fn ready_with_share(h: &Harness) -> ShareHandle {
        let instance = InstanceHandle::new("p", "l", "fs-1");
        let mut entry = InstanceEntry::new(instance.clone(), "default", TIB, 10);
        entry.state = LifecycleState::Ready;
        h.model.insert_instance(entry).unwrap();
        let share = instance.share("a");
        let mut s = ShareEntry::new(share.clone(), "default", 100 * GIB);
        s.state = LifecycleState::Ready;
        h.model.insert_share(s).unwrap();
        h.model.attach_share(&share, 100 * GIB).unwrap();

        let writer = StateWriter::new(h.store.clone(), h.model.clone(), h.registry.clone());
        writer.instance(&instance).await.unwrap();
        writer.share(&share).await.unwrap();
        for key in [ResourceKey::from(instance), ResourceKey::from(share.clone())] {
            h.store.set_finalizer(&key, true).await.unwrap();
        }
        share
    }

    #[tokio::test]
    async fn test_instance_create_completes() {
        // A bare instance with no shares would be reclaimed straight away
        let h = harness_with(
            1,
            ReconcilerConfig {
                jitter: 0.0,
                reclaim_empty_instances: false,
                ..ReconcilerConfig::default()
            },
        );
        let instance = InstanceHandle::new("p", "l", "fs-1");
        h.model
            .insert_instance(InstanceEntry::new(instance.clone(), "default", TIB, 10))
            .unwrap();
        let t0 = Utc::now();
        h.registry
            .register(Intent::new(instance.clone(), OperationType::InstanceCreate, TIB), t0)
            .unwrap();

        let report = h.reconciler.reconcile_once(t0).await;
        assert_eq!(report.started, 1);

        let report = h.reconciler.reconcile_once(secs(t0, 3)).await;
        assert_eq!(report.succeeded, vec![OperationType::InstanceCreate]);
        assert_eq!(h.model.instance(&instance).unwrap().state, LifecycleState::Ready);
        assert_eq!(h.registry.counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_polls_wait_for_backoff() {
        let h = harness(10);
        let instance = InstanceHandle::new("p", "l", "fs-1");
        h.model
            .insert_instance(InstanceEntry::new(instance.clone(), "default", TIB, 10))
            .unwrap();
        let t0 = Utc::now();
        let id = h
            .registry
            .register(Intent::new(instance, OperationType::InstanceCreate, TIB), t0)
            .unwrap();

        h.reconciler.reconcile_once(t0).await;
        assert_eq!(h.reconciler.next_due(id), Some(t0 + chrono::Duration::seconds(2)));

        // Not due yet
        let report = h.reconciler.reconcile_once(secs(t0, 1)).await;
        assert_eq!(report.polled, 0);

        let report = h.reconciler.reconcile_once(secs(t0, 2)).await;
        assert_eq!(report.polled, 1);
        // Second interval doubles
        assert_eq!(h.reconciler.next_due(id), Some(secs(t0, 6)));
    }

    #[tokio::test]
    async fn test_finalizer_held_until_delete_succeeds() {
        let h = harness(2);
        let share = ready_with_share(&h).await;
        let key = ResourceKey::from(share.clone());
        let t0 = Utc::now();
        h.registry
            .register(Intent::new(share.clone(), OperationType::ShareDelete, 100 * GIB), t0)
            .unwrap();
        h.model.set_share_state(&share, LifecycleState::Deleting).unwrap();

        h.reconciler.reconcile_once(t0).await;
        h.reconciler.reconcile_once(secs(t0, 2)).await;
        assert!(h.store.has_finalizer(&key).await.unwrap());
        assert!(h.model.share(&share).is_some());

        let report = h.reconciler.reconcile_once(secs(t0, 6)).await;
        assert_eq!(report.succeeded, vec![OperationType::ShareDelete]);
        assert!(h.model.share(&share).is_none());
        assert!(h.store.load_shares().await.unwrap().is_empty());
        assert_eq!(h.model.instance(&share.instance).unwrap().consumed_capacity(), 0);
    }

    #[tokio::test]
    async fn test_empty_instance_is_reclaimed() {
        let h = harness(1);
        let share = ready_with_share(&h).await;
        let t0 = Utc::now();
        h.registry
            .register(Intent::new(share.clone(), OperationType::ShareDelete, 100 * GIB), t0)
            .unwrap();

        h.reconciler.reconcile_once(t0).await;
        let report = h.reconciler.reconcile_once(secs(t0, 2)).await;
        assert_eq!(report.reclaimed, 1);
        let instance_key = ResourceKey::from(share.instance.clone());
        assert_eq!(
            h.registry.active_for(&instance_key).unwrap().op_type,
            OperationType::InstanceDelete
        );

        h.reconciler.reconcile_once(secs(t0, 3)).await;
        h.reconciler.reconcile_once(secs(t0, 6)).await;
        assert!(!h.model.contains_instance(&share.instance));
        assert!(h.store.load_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_retries_after_store_failure() {
        let h = harness(1);
        let share = ready_with_share(&h).await;
        let key = ResourceKey::from(share.clone());
        let t0 = Utc::now();
        let id = h
            .registry
            .register(Intent::new(share.clone(), OperationType::ShareDelete, 100 * GIB), t0)
            .unwrap();
        h.model.set_share_state(&share, LifecycleState::Deleting).unwrap();
        h.reconciler.reconcile_once(t0).await;

        // Backend confirms the delete but the marker cannot be cleared yet
        h.store.fail_next_write(key.clone());
        let report = h.reconciler.reconcile_once(secs(t0, 2)).await;
        assert_eq!(report.backend_errors, 1);
        assert!(report.succeeded.is_empty());
        assert_eq!(report.reclaimed, 0);
        assert!(h.registry.get(id).unwrap().completing);
        assert!(h.registry.is_busy(&key));
        assert!(h.registry.is_busy(&ResourceKey::from(share.instance.clone())));
        assert!(h.store.has_finalizer(&key).await.unwrap());
        assert_eq!(h.store.load_shares().await.unwrap().len(), 1);

        let report = h.reconciler.reconcile_once(secs(t0, 6)).await;
        assert_eq!(report.succeeded, vec![OperationType::ShareDelete]);
        assert_eq!(report.polled, 0);
        assert_eq!(report.reclaimed, 1);
        assert!(h.registry.get(id).is_none());
        assert!(!h.store.has_finalizer(&key).await.unwrap());
        assert!(h.store.load_shares().await.unwrap().is_empty());
        assert!(h.model.share(&share).is_none());
        assert_eq!(h.model.instance(&share.instance).unwrap().consumed_capacity(), 0);
    }

    #[tokio::test]
    async fn test_failed_instance_reclaimed_after_eviction() {
        let h = harness(1);
        let instance = InstanceHandle::new("p", "l", "fs-1");
        h.model
            .insert_instance(InstanceEntry::new(instance.clone(), "default", TIB, 10))
            .unwrap();
        h.backend
            .fail_target(ResourceKey::from(instance.clone()), "zone exhausted");
        let t0 = Utc::now();
        h.registry
            .register(Intent::new(instance.clone(), OperationType::InstanceCreate, TIB), t0)
            .unwrap();

        h.reconciler.reconcile_once(t0).await;
        let report = h.reconciler.reconcile_once(secs(t0, 2)).await;
        assert_eq!(report.failed, vec![OperationType::InstanceCreate]);
        assert_eq!(report.reclaimed, 0);
        assert_eq!(h.model.instance(&instance).unwrap().state, LifecycleState::Error);

        // Held while the failure is still queryable
        h.backend.clear_faults();
        let report = h.reconciler.reconcile_once(secs(t0, 2 + 15 * 60)).await;
        assert_eq!(report.reclaimed, 0);

        let report = h.reconciler.reconcile_once(secs(t0, 3 + 15 * 60)).await;
        assert_eq!(report.evicted, 1);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(h.model.instance(&instance).unwrap().state, LifecycleState::Deleting);

        h.reconciler.reconcile_once(secs(t0, 4 + 15 * 60)).await;
        let report = h.reconciler.reconcile_once(secs(t0, 6 + 15 * 60)).await;
        assert_eq!(report.succeeded, vec![OperationType::InstanceDelete]);
        assert!(!h.model.contains_instance(&instance));
        assert!(h.store.load_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_delay_overrides_backoff() {
        let h = harness(1);
        let t0 = Utc::now();
        let id = OperationId(7);

        let conflict = Error::Conflict {
            resource: "fs-1".into(),
            existing: "instancedelete".into(),
        };
        h.reconciler.defer_after(id, t0, &conflict);
        assert_eq!(h.reconciler.next_due(id), Some(secs(t0, 30)));

        let unknown = Error::UnknownState {
            resource: "fs-1".into(),
            detail: "no definite status".into(),
        };
        h.reconciler.defer_after(id, t0, &unknown);
        assert_eq!(h.reconciler.next_due(id), Some(secs(t0, 60)));

        let other = OperationId(8);
        h.reconciler
            .defer_after(other, t0, &Error::backend("poll", "deadline exceeded"));
        assert_eq!(h.reconciler.next_due(other), Some(secs(t0, 2)));
    }

    #[tokio::test]
    async fn test_failure_is_retained_then_evicted() {
        let h = harness(1);
        let share = ready_with_share(&h).await;
        let key = ResourceKey::from(share.clone());
        h.backend.fail_target(key.clone(), "quota exceeded");
        let t0 = Utc::now();
        h.registry
            .register(Intent::new(share.clone(), OperationType::ShareDelete, 100 * GIB), t0)
            .unwrap();
        h.model.set_share_state(&share, LifecycleState::Deleting).unwrap();

        h.reconciler.reconcile_once(t0).await;
        let report = h.reconciler.reconcile_once(secs(t0, 2)).await;
        assert_eq!(report.failed, vec![OperationType::ShareDelete]);
        assert_eq!(h.model.share(&share).unwrap().state, LifecycleState::Error);
        assert!(h.store.has_finalizer(&key).await.unwrap());

        let failed = h.registry.failed_for(&key).unwrap();
        let record = h.store.load_shares().await.unwrap().remove(0);
        assert_eq!(record.error.as_deref(), failed.error.as_deref());

        let report = h.reconciler.reconcile_once(secs(t0, 2 + 15 * 60)).await;
        assert_eq!(report.evicted, 0);
        let report = h.reconciler.reconcile_once(secs(t0, 3 + 15 * 60)).await;
        assert_eq!(report.evicted, 1);
        assert!(h.registry.failed_for(&key).is_none());
    }

    #[tokio::test]
    async fn test_stuck_operation_goes_unknown_then_fails() {
        let h = harness(1);
        let share = ready_with_share(&h).await;
        h.backend.stall_target(ResourceKey::from(share.clone()));
        let t0 = Utc::now();
        let id = h
            .registry
            .register(Intent::new(share.clone(), OperationType::ShareUpdate, 200 * GIB), t0)
            .unwrap();

        h.reconciler.reconcile_once(t0).await;
        let past_ceiling = secs(t0, 2 * 60 * 60 + 1);
        let report = h.reconciler.reconcile_once(past_ceiling).await;
        assert_eq!(report.unknown, 1);
        assert_eq!(h.registry.get(id).unwrap().status, OperationStatus::Unknown);
        assert!(report.succeeded.is_empty() && report.failed.is_empty());

        let report = h.reconciler.reconcile_once(secs(past_ceiling, 10 * 60 + 61)).await;
        assert_eq!(report.failed, vec![OperationType::ShareUpdate]);
        // Update failures leave the share usable at its old size
        let entry = h.model.share(&share).unwrap();
        assert_eq!(entry.state, LifecycleState::Ready);
        assert_eq!(entry.capacity, 100 * GIB);
    }

    #[tokio::test]
    async fn test_backend_outage_only_backs_off() {
        let h = harness(1);
        let instance = InstanceHandle::new("p", "l", "fs-1");
        h.model
            .insert_instance(InstanceEntry::new(instance.clone(), "default", TIB, 10))
            .unwrap();
        h.backend.set_available(false);
        let t0 = Utc::now();
        let id = h
            .registry
            .register(Intent::new(instance, OperationType::InstanceCreate, TIB), t0)
            .unwrap();

        let report = h.reconciler.reconcile_once(t0).await;
        assert_eq!(report.backend_errors, 1);
        assert_eq!(h.registry.get(id).unwrap().status, OperationStatus::Running);

        h.backend.set_available(true);
        let report = h.reconciler.reconcile_once(secs(t0, 2)).await;
        assert_eq!(report.started, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness(1);
        let cancel = CancellationToken::new();
        let reconciler = h.reconciler.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { reconciler.run(token, |_| {}).await });
        cancel.cancel();
        task.await.unwrap();
    }
}
