//! Multishare Controller
//!
//! Entry point for orchestrator requests. Coordinates:
//! - Share placement through the packing allocator
//! - Registration of lifecycle operations
//! - Persistence of instance/share records and their finalizers
//! - Rebuild of in-memory state after a restart

use crate::controlplane::metrics::ControllerMetrics;
use crate::domain::ports::{OperationBackend, ResourceStore};
use crate::error::{Error, Result};
use crate::multishare::{
    CapacityModel, Constraints, FinalizerGuard, InstanceEntry, InstanceHandle, Intent,
    LifecycleState, ModelStats, Operation, OperationId, OperationReconciler, OperationRegistry,
    OperationType, PackingAllocator, PackingPolicy, PlacementDecision, PlacementOrder,
    ReconcilerConfig, ResourceKey, ShareEntry, ShareHandle, ShareRequest, StateWriter, VolumeId,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Placement passes before a contended create gives up
const MAX_PLACEMENT_ATTEMPTS: usize = 32;

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the controller, loadable from YAML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Capacity and packing limits
    pub constraints: Constraints,
    /// Placement policy
    pub packing: PackingPolicy,
    /// Operation polling tunables
    pub reconciler: ReconcilerConfig,
}

impl ControllerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.constraints.validate()?;
        self.reconciler.validate()
    }
}

// =============================================================================
// Request Outcomes
// =============================================================================

/// Accepted share creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareProvisioned {
    pub volume_id: String,
    pub share: ShareHandle,
    pub instance: InstanceHandle,
    pub capacity_bytes: u64,
    /// `existing`, `grow`, `new_instance` or `already_exists`
    pub placement: &'static str,
    pub state: LifecycleState,
    pub operation: Option<OperationId>,
}

/// Accepted share deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum DeleteOutcome {
    /// Nothing to delete
    AlreadyDeleted,
    /// Delete operation registered
    Pending { operation: OperationId },
}

/// Accepted share expansion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum ExpandOutcome {
    /// Share already has the requested size
    Unchanged { capacity_bytes: u64 },
    /// Resize registered, growing the instance first when `instance_capacity` is set
    Pending {
        operation: OperationId,
        instance_capacity: Option<u64>,
    },
}

/// What a rebuild restored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub instances: usize,
    pub shares: usize,
    pub operations: usize,
    pub reissued: usize,
    pub finished_deletes: usize,
    pub skipped: usize,
}

// =============================================================================
// Views
// =============================================================================

/// Serializable view of an instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub handle: InstanceHandle,
    pub storage_class_key: String,
    pub total_capacity_bytes: u64,
    pub consumed_capacity_bytes: u64,
    pub max_shares: u32,
    pub shares: BTreeMap<String, u64>,
    pub state: LifecycleState,
    pub finalizer: bool,
}

impl From<InstanceEntry> for InstanceView {
    fn from(e: InstanceEntry) -> Self {
        Self {
            consumed_capacity_bytes: e.consumed_capacity(),
            handle: e.handle,
            storage_class_key: e.storage_class_key,
            total_capacity_bytes: e.total_capacity,
            max_shares: e.max_shares,
            shares: e.shares,
            state: e.state,
            finalizer: e.finalizer,
        }
    }
}

/// Serializable view of an operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationView {
    pub id: OperationId,
    pub target: String,
    pub op_type: String,
    pub status: String,
    pub capacity_bytes: u64,
    pub backend_name: Option<String>,
    pub start_time: String,
    pub error: Option<String>,
}

impl From<Operation> for OperationView {
    fn from(op: Operation) -> Self {
        let record = op.to_record();
        Self {
            id: op.id,
            target: op.target.to_string(),
            op_type: record.op_type,
            status: record.status,
            capacity_bytes: op.capacity_bytes,
            backend_name: op.backend_name,
            start_time: record.start_time,
            error: op.error,
        }
    }
}

/// Controller status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub version: String,
    pub placement_order: PlacementOrder,
    pub model: ModelStats,
    pub active_operations: usize,
    pub failed_operations: usize,
}

/// Reject identifier segments that would not survive a round trip
fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') {
        return Err(Error::Validation(format!(
            "{} {:?} must be non-empty and contain no '/'",
            field, value
        )));
    }
    Ok(())
}

// =============================================================================
// Multishare Controller
// =============================================================================

/// Coordinates placement, operations and persistence for shares
pub struct MultishareController {
    config: ControllerConfig,
    model: Arc<CapacityModel>,
    registry: Arc<OperationRegistry>,
    allocator: PackingAllocator,
    writer: Arc<StateWriter>,
    guard: Arc<FinalizerGuard>,
    reconciler: Arc<OperationReconciler>,
    metrics: Option<Arc<ControllerMetrics>>,
}

impl MultishareController {
    /// Create a controller over a backend and a resource store
    pub fn new(
        config: ControllerConfig,
        backend: Arc<dyn OperationBackend>,
        store: Arc<dyn ResourceStore>,
        metrics: Option<Arc<ControllerMetrics>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let model = CapacityModel::new(config.constraints.clone());
        let registry = Arc::new(OperationRegistry::new());
        let allocator = PackingAllocator::new(config.constraints.clone(), config.packing.clone());
        let writer = Arc::new(StateWriter::new(store.clone(), model.clone(), registry.clone()));
        let guard = Arc::new(FinalizerGuard::new(store, model.clone()));
        let reconciler = OperationReconciler::new(
            config.reconciler.clone(),
            registry.clone(),
            model.clone(),
            backend,
            writer.clone(),
            guard.clone(),
        );

        info!(
            "Multishare controller initialized (order {:?}, {} shares/instance)",
            config.packing.order, config.constraints.max_shares_per_instance
        );

        Ok(Arc::new(Self {
            config,
            model,
            registry,
            allocator,
            writer,
            guard,
            reconciler,
            metrics,
        }))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<CapacityModel> {
        &self.model
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn reconciler(&self) -> &Arc<OperationReconciler> {
        &self.reconciler
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    /// Place a new share and register the operations that create it
    ///
    /// Repeating a request for a share that already exists with the same
    /// size returns the existing share.
    pub async fn create_share(&self, request: ShareRequest) -> Result<ShareProvisioned> {
        validate_segment("share name", &request.name)?;
        validate_segment("project", &request.project)?;
        validate_segment("location", &request.location)?;
        let constraints = self.allocator.effective_constraints(&request)?;
        let class_key = request.storage_class_key();
        validate_segment("storage class", &class_key)?;

        if let Some(existing) = self.find_share(&request, &class_key) {
            return self.existing_share(existing, &request).await;
        }

        let mut skipped: HashSet<InstanceHandle> = HashSet::new();
        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            let candidates = self.model.candidates(&class_key);
            let decision = self.allocator.place(&request, &candidates, |h| {
                skipped.contains(h) || self.registry.is_busy(&ResourceKey::Instance(h.clone()))
            })?;

            match self.commit(&request, &constraints, &class_key, &decision).await {
                Ok(Some(provisioned)) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_placement(decision.kind());
                    }
                    info!(
                        "Placed share {} ({} bytes) on {} [{}]",
                        request.name,
                        request.capacity_bytes,
                        decision.instance(),
                        decision.kind()
                    );
                    return Ok(provisioned);
                }
                Ok(None) => debug!(
                    "Instance {} changed before it was claimed, placing {} again",
                    decision.instance(),
                    request.name
                ),
                Err(Error::Conflict { resource, existing })
                    if !matches!(decision, PlacementDecision::NewInstance { .. }) =>
                {
                    debug!(
                        "Instance {} claimed by {} on {}, placing elsewhere",
                        decision.instance(),
                        existing,
                        resource
                    );
                    skipped.insert(decision.instance().clone());
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict {
            resource: request.name.clone(),
            existing: format!("{} contended placements", MAX_PLACEMENT_ATTEMPTS),
        })
    }

    fn find_share(&self, request: &ShareRequest, class_key: &str) -> Option<ShareEntry> {
        self.model.shares().into_iter().find(|s| {
            s.handle.name == request.name
                && s.instance().project == request.project
                && s.instance().location == request.location
                && s.storage_class_key == class_key
                && s.state != LifecycleState::Deleted
        })
    }

    async fn existing_share(&self, share: ShareEntry, request: &ShareRequest) -> Result<ShareProvisioned> {
        let key = ResourceKey::Share(share.handle.clone());
        if share.capacity != request.capacity_bytes {
            return Err(Error::Validation(format!(
                "share {} already exists with {} bytes",
                share.handle, share.capacity
            )));
        }

        match share.state {
            LifecycleState::Deleting => {
                return Err(Error::Conflict {
                    resource: share.handle.to_string(),
                    existing: OperationType::ShareDelete.to_string(),
                })
            }
            LifecycleState::Error => return self.retry_failed_share(share).await,
            _ => {}
        }

        let operation = self
            .registry
            .active_for(&key)
            .filter(|op| op.target == key)
            .or_else(|| self.registry.active_for(&ResourceKey::Instance(share.instance().clone())))
            .map(|op| op.id);
        Ok(ShareProvisioned {
            volume_id: share.volume_id().to_string(),
            instance: share.instance().clone(),
            share: share.handle,
            capacity_bytes: share.capacity,
            placement: "already_exists",
            state: share.state,
            operation,
        })
    }

    /// Issue a fresh create for a share whose previous create failed
    async fn retry_failed_share(&self, share: ShareEntry) -> Result<ShareProvisioned> {
        let ready = self
            .model
            .instance(share.instance())
            .is_some_and(|i| i.state == LifecycleState::Ready);
        if !ready {
            return Err(Error::Conflict {
                resource: share.handle.to_string(),
                existing: format!("failed share on unavailable instance {}", share.instance()),
            });
        }

        let intent = Intent::new(share.handle.clone(), OperationType::ShareCreate, share.capacity);
        let id = self.registry.register(intent, Utc::now())?;
        if !self.model.can_fit(share.instance(), share.capacity) {
            self.registry.abandon(id)?;
            return Err(Error::CapacityExhausted {
                requested: share.capacity,
                reason: format!("instance {} no longer has room for {}", share.instance(), share.handle),
            });
        }
        self.model.set_share_state(&share.handle, LifecycleState::Pending)?;
        if let Err(e) = self.writer.share(&share.handle).await {
            self.rollback(id, &share.handle, None).await;
            return Err(e);
        }

        info!("Retrying create of failed share {} as {}", share.handle, id);
        Ok(ShareProvisioned {
            volume_id: share.volume_id().to_string(),
            instance: share.handle.instance.clone(),
            share: share.handle,
            capacity_bytes: share.capacity,
            placement: "existing",
            state: LifecycleState::Pending,
            operation: Some(id),
        })
    }

    /// Whether a claimed instance still matches what placement saw
    fn still_fits(&self, decision: &PlacementDecision, bytes: u64, constraints: &Constraints) -> bool {
        match decision {
            PlacementDecision::Existing { instance } => {
                self.model.instance(instance).is_some_and(|e| e.can_fit(bytes))
            }
            PlacementDecision::Grow {
                instance,
                new_capacity,
            } => {
                self.model.instance(instance).and_then(|e| {
                    e.growth_needed(bytes, constraints)
                        .filter(|delta| *delta > 0)
                        .map(|delta| e.total_capacity + delta)
                }) == Some(*new_capacity)
            }
            PlacementDecision::NewInstance { .. } => true,
        }
    }

    /// Register the operations for a decision and stage its records
    ///
    /// `None` means the instance changed between the snapshot and the claim;
    /// nothing was registered and the caller should place again.
    async fn commit(
        &self,
        request: &ShareRequest,
        constraints: &Constraints,
        class_key: &str,
        decision: &PlacementDecision,
    ) -> Result<Option<ShareProvisioned>> {
        let now = Utc::now();
        let share = decision.instance().share(request.name.clone());
        let share_intent = Intent::new(share.clone(), OperationType::ShareCreate, request.capacity_bytes);

        let (intent, new_instance) = match decision {
            PlacementDecision::Existing { .. } => (share_intent, None),
            PlacementDecision::Grow {
                instance,
                new_capacity,
            } => (
                Intent::new(instance.clone(), OperationType::InstanceUpdate, *new_capacity)
                    .then(share_intent),
                None,
            ),
            PlacementDecision::NewInstance { instance, capacity } => (
                Intent::new(instance.clone(), OperationType::InstanceCreate, *capacity)
                    .then(share_intent),
                Some(InstanceEntry::new(
                    instance.clone(),
                    class_key,
                    *capacity,
                    constraints.max_shares_per_instance,
                )),
            ),
        };

        let id = self.registry.register(intent, now)?;
        if !self.still_fits(decision, request.capacity_bytes, constraints) {
            self.registry.abandon(id)?;
            return Ok(None);
        }
        let created_instance = new_instance.as_ref().map(|e| e.handle.clone());
        if let Err(e) = self.stage(decision, new_instance, &share, class_key, request.capacity_bytes) {
            self.rollback(id, &share, created_instance.as_ref()).await;
            return Err(e);
        }
        if let Err(e) = self.persist_staged(&share, created_instance.as_ref()).await {
            self.rollback(id, &share, created_instance.as_ref()).await;
            return Err(e);
        }

        Ok(Some(ShareProvisioned {
            volume_id: VolumeId::new(class_key, share.clone()).to_string(),
            instance: share.instance.clone(),
            share,
            capacity_bytes: request.capacity_bytes,
            placement: decision.kind(),
            state: LifecycleState::Pending,
            operation: Some(id),
        }))
    }

    /// Model changes for a registered placement; nothing is debited yet
    fn stage(
        &self,
        decision: &PlacementDecision,
        new_instance: Option<InstanceEntry>,
        share: &ShareHandle,
        class_key: &str,
        capacity: u64,
    ) -> Result<()> {
        if let Some(entry) = new_instance {
            self.model.insert_instance(entry)?;
        }
        if let PlacementDecision::Grow { instance, .. } = decision {
            self.model.set_instance_state(instance, LifecycleState::Updating)?;
        }
        self.model
            .insert_share(ShareEntry::new(share.clone(), class_key, capacity))
    }

    async fn persist_staged(&self, share: &ShareHandle, new_instance: Option<&InstanceHandle>) -> Result<()> {
        self.writer.instance(&share.instance).await?;
        if let Some(handle) = new_instance {
            self.guard.protect(&ResourceKey::Instance(handle.clone())).await?;
        }
        self.writer.share(share).await?;
        self.guard.protect(&ResourceKey::Share(share.clone())).await
    }

    /// Undo a registration whose records could not be written
    async fn rollback(&self, id: OperationId, share: &ShareHandle, new_instance: Option<&InstanceHandle>) {
        if let Err(e) = self.registry.abandon(id) {
            warn!("{} already issued, leaving it to the reconciler: {}", id, e);
            return;
        }

        let store = self.writer.store();
        self.model.remove_share(share);
        let share_key = ResourceKey::Share(share.clone());
        if let Err(e) = store.set_finalizer(&share_key, false).await {
            debug!("Could not clear finalizer on {}: {}", share, e);
        }
        if let Err(e) = store.remove_share(share).await {
            warn!("Could not remove staged share {}: {}", share, e);
        }

        match new_instance {
            Some(handle) => {
                if let Err(e) = self.model.remove_instance(handle) {
                    warn!("Could not drop staged instance {}: {}", handle, e);
                }
                let key = ResourceKey::Instance(handle.clone());
                if let Err(e) = store.set_finalizer(&key, false).await {
                    debug!("Could not clear finalizer on {}: {}", handle, e);
                }
                if let Err(e) = store.remove_instance(handle).await {
                    warn!("Could not remove staged instance {}: {}", handle, e);
                }
            }
            None => {
                let restored = self
                    .model
                    .instance(&share.instance)
                    .is_some_and(|i| i.state == LifecycleState::Updating)
                    && self
                        .model
                        .set_instance_state(&share.instance, LifecycleState::Ready)
                        .is_ok();
                if restored {
                    if let Err(e) = self.writer.instance(&share.instance).await {
                        warn!("Could not rewrite instance {}: {}", share.instance, e);
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Delete
    // -------------------------------------------------------------------------

    /// Register the delete of a share
    ///
    /// Deleting a share that is unknown or already gone succeeds. A second
    /// delete while one is in flight fails with `Conflict`.
    pub async fn delete_share(&self, volume_id: &str) -> Result<DeleteOutcome> {
        let volume: VolumeId = volume_id.parse()?;
        let share = volume.share;
        let Some(entry) = self.model.share(&share) else {
            debug!("Share {} unknown, nothing to delete", share);
            return Ok(DeleteOutcome::AlreadyDeleted);
        };
        if entry.state == LifecycleState::Deleted {
            return Ok(DeleteOutcome::AlreadyDeleted);
        }

        let intent = Intent::new(share.clone(), OperationType::ShareDelete, entry.capacity);
        let id = self.registry.register(intent, Utc::now())?;
        let previous = self.model.set_share_state(&share, LifecycleState::Deleting)?;

        if let Err(e) = self.writer.share(&share).await {
            if self.registry.abandon(id).is_ok() {
                if let Err(revert) = self.model.set_share_state(&share, previous) {
                    warn!("Could not restore share {} to {}: {}", share, previous, revert);
                }
            }
            return Err(e);
        }

        info!("Deleting share {} as {}", share, id);
        Ok(DeleteOutcome::Pending { operation: id })
    }

    // -------------------------------------------------------------------------
    // Expand
    // -------------------------------------------------------------------------

    /// Register a resize of a share, growing its instance first if needed
    pub async fn expand_share(
        &self,
        volume_id: &str,
        capacity_bytes: u64,
        parameters: &BTreeMap<String, String>,
    ) -> Result<ExpandOutcome> {
        let volume: VolumeId = volume_id.parse()?;
        let share = volume.share;
        let entry = self.model.share(&share).ok_or_else(|| Error::ResourceNotFound {
            kind: "Share".into(),
            name: share.to_string(),
        })?;

        let constraints = self.config.constraints.for_parameters(parameters)?;
        constraints.validate_share_size(capacity_bytes)?;
        if capacity_bytes < entry.capacity {
            return Err(Error::Validation(format!(
                "share {} cannot shrink from {} to {} bytes",
                share, entry.capacity, capacity_bytes
            )));
        }
        if capacity_bytes == entry.capacity {
            return Ok(ExpandOutcome::Unchanged { capacity_bytes });
        }
        if entry.state != LifecycleState::Ready {
            return Err(Error::Conflict {
                resource: share.to_string(),
                existing: format!("share is {}", entry.state),
            });
        }

        let instance = self.model.instance(&share.instance).ok_or_else(|| Error::ResourceNotFound {
            kind: "Instance".into(),
            name: share.instance.to_string(),
        })?;
        if instance.state != LifecycleState::Ready {
            return Err(Error::Conflict {
                resource: instance.handle.to_string(),
                existing: format!("instance is {}", instance.state),
            });
        }

        let delta = capacity_bytes - entry.capacity;
        let share_intent = Intent::new(share.clone(), OperationType::ShareUpdate, capacity_bytes);
        let (intent, grow_to) = if instance.headroom() >= delta {
            (share_intent, None)
        } else {
            let target = self
                .config
                .constraints
                .round_up_to_step(instance.consumed_capacity() + delta);
            if target > self.config.constraints.max_instance_size {
                return Err(Error::CapacityExhausted {
                    requested: capacity_bytes,
                    reason: format!(
                        "instance {} would need {} bytes, above the {} byte ceiling",
                        instance.handle, target, self.config.constraints.max_instance_size
                    ),
                });
            }
            (
                Intent::new(instance.handle.clone(), OperationType::InstanceUpdate, target)
                    .then(share_intent),
                Some(target),
            )
        };

        let id = self.registry.register(intent, Utc::now())?;
        self.model.set_share_state(&share, LifecycleState::Updating)?;
        if grow_to.is_some() {
            self.model
                .set_instance_state(&instance.handle, LifecycleState::Updating)?;
        }

        let persisted = match self.writer.share(&share).await {
            Ok(()) => self.writer.instance(&instance.handle).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            if self.registry.abandon(id).is_ok() {
                if let Err(revert) = self.model.set_share_state(&share, LifecycleState::Ready) {
                    warn!("Could not restore share {}: {}", share, revert);
                }
                if grow_to.is_some() {
                    if let Err(revert) = self
                        .model
                        .set_instance_state(&instance.handle, LifecycleState::Ready)
                    {
                        warn!("Could not restore instance {}: {}", instance.handle, revert);
                    }
                }
            }
            return Err(e);
        }

        info!(
            "Expanding share {} to {} bytes as {}{}",
            share,
            capacity_bytes,
            id,
            grow_to.map(|t| format!(" (instance to {})", t)).unwrap_or_default()
        );
        Ok(ExpandOutcome::Pending {
            operation: id,
            instance_capacity: grow_to,
        })
    }

    // -------------------------------------------------------------------------
    // Rebuild
    // -------------------------------------------------------------------------

    /// Reload the model and registry from the resource store
    ///
    /// Run once at startup before the reconciler. Follow-up operations that
    /// only lived in memory are recomputed from resource states.
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let store = self.writer.store().clone();
        let mut report = RebuildReport::default();

        for record in store.load_instances().await? {
            let key = ResourceKey::Instance(record.handle.clone());
            let mut entry = InstanceEntry::new(
                record.handle.clone(),
                record.storage_class_key,
                record.capacity_bytes,
                record.max_shares,
            );
            entry.state = record.state;
            entry.finalizer = store.has_finalizer(&key).await?;
            match self.model.insert_instance(entry) {
                Ok(()) => report.instances += 1,
                Err(e) => {
                    warn!("Skipping instance {}: {}", record.handle, e);
                    report.skipped += 1;
                }
            }
        }

        for record in store.load_shares().await? {
            let key = ResourceKey::Share(record.handle.clone());
            let mut entry = ShareEntry::new(record.handle.clone(), record.storage_class_key, record.capacity_bytes);
            entry.state = record.state;
            entry.finalizer = store.has_finalizer(&key).await?;
            if let Err(e) = self.model.insert_share(entry) {
                warn!("Skipping share {}: {}", record.handle, e);
                report.skipped += 1;
                continue;
            }
            if matches!(
                record.state,
                LifecycleState::Ready | LifecycleState::Updating | LifecycleState::Deleting
            ) {
                if let Err(e) = self.model.attach_share(&record.handle, record.capacity_bytes) {
                    warn!("Share {} does not fit its instance: {}", record.handle, e);
                }
            }
            report.shares += 1;
        }

        for (target, record) in store.load_operations().await? {
            match self.registry.restore(target.clone(), &record) {
                Ok(_) => report.operations += 1,
                Err(e) => {
                    warn!("Skipping persisted operation for {}: {}", target, e);
                    report.skipped += 1;
                }
            }
        }

        let now = Utc::now();
        for share in self.model.shares() {
            self.resume_share(share, now, &mut report).await?;
        }
        for instance in self.model.instances() {
            self.resume_instance(instance, &mut report).await?;
        }

        info!(
            "Rebuilt {} instances, {} shares, {} operations ({} reissued)",
            report.instances, report.shares, report.operations, report.reissued
        );
        Ok(report)
    }

    async fn resume_share(
        &self,
        share: ShareEntry,
        now: chrono::DateTime<Utc>,
        report: &mut RebuildReport,
    ) -> Result<()> {
        let key = ResourceKey::Share(share.handle.clone());
        if self.registry.active_for(&key).is_some() {
            return Ok(());
        }
        let instance_key = ResourceKey::Instance(share.instance().clone());

        match share.state {
            LifecycleState::Pending => {
                let intent = Intent::new(share.handle.clone(), OperationType::ShareCreate, share.capacity);
                let instance_op = self
                    .registry
                    .active_for(&instance_key)
                    .filter(|op| op.target == instance_key);
                let instance_ready = self
                    .model
                    .instance(share.instance())
                    .is_some_and(|i| i.state == LifecycleState::Ready);

                let result = match (instance_op, instance_ready) {
                    (Some(_), _) => self.registry.attach_follow_up(&instance_key, intent),
                    (None, true) => self.registry.register(intent, now),
                    (None, false) => {
                        warn!("Pending share {} has no live instance", share.handle);
                        return Ok(());
                    }
                };
                match result {
                    Ok(_) => report.reissued += 1,
                    Err(e) => warn!("Could not resume create of {}: {}", share.handle, e),
                }
            }
            LifecycleState::Updating => {
                info!("Expansion of {} was interrupted, reverting to ready", share.handle);
                self.model.set_share_state(&share.handle, LifecycleState::Ready)?;
                self.writer.share(&share.handle).await?;
            }
            LifecycleState::Deleting if share.finalizer => {
                let intent = Intent::new(share.handle.clone(), OperationType::ShareDelete, share.capacity);
                match self.registry.register(intent, now) {
                    Ok(_) => report.reissued += 1,
                    Err(e) => warn!("Could not resume delete of {}: {}", share.handle, e),
                }
            }
            LifecycleState::Deleting | LifecycleState::Deleted if !share.finalizer => {
                // Delete confirmed before the restart; finish the removal
                self.writer.store().remove_share(&share.handle).await?;
                self.model.detach_share(&share.handle)?;
                self.model.remove_share(&share.handle);
                self.writer.instance(share.instance()).await?;
                report.finished_deletes += 1;
            }
            _ => {}
        }
        Ok(())
    }

    async fn resume_instance(&self, instance: InstanceEntry, report: &mut RebuildReport) -> Result<()> {
        let key = ResourceKey::Instance(instance.handle.clone());
        if self.registry.active_for(&key).is_some() {
            return Ok(());
        }

        match instance.state {
            LifecycleState::Updating => {
                info!("Resize of {} was interrupted, reverting to ready", instance.handle);
                self.model
                    .set_instance_state(&instance.handle, LifecycleState::Ready)?;
                self.writer.instance(&instance.handle).await?;
            }
            LifecycleState::Deleting if instance.finalizer => {
                let intent = Intent::new(
                    instance.handle.clone(),
                    OperationType::InstanceDelete,
                    instance.total_capacity,
                );
                match self.registry.register(intent, Utc::now()) {
                    Ok(_) => report.reissued += 1,
                    Err(e) => warn!("Could not resume delete of {}: {}", instance.handle, e),
                }
            }
            LifecycleState::Deleting | LifecycleState::Deleted if instance.shares.is_empty() => {
                self.writer.store().remove_instance(&instance.handle).await?;
                self.model.remove_instance(&instance.handle)?;
                report.finished_deletes += 1;
            }
            _ => {}
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn instances(&self) -> Vec<InstanceView> {
        self.model.instances().into_iter().map(InstanceView::from).collect()
    }

    /// Active operations followed by retained failures
    pub fn operations(&self) -> Vec<OperationView> {
        self.registry
            .list_active()
            .chain(self.registry.list_failed())
            .map(OperationView::from)
            .collect()
    }

    pub fn status(&self) -> ControllerStatus {
        let (active, failed) = self.registry.counts();
        ControllerStatus {
            version: crate::VERSION.to_string(),
            placement_order: self.config.packing.order,
            model: self.model.stats(),
            active_operations: active,
            failed_operations: failed,
        }
    }

    /// Drive operations until cancelled, feeding metrics after every pass
    pub async fn run_reconciler(&self, cancel: CancellationToken) {
        self.reconciler
            .run(cancel, |report| {
                if let Some(metrics) = &self.metrics {
                    let (active, failed) = self.registry.counts();
                    metrics.record_report(report);
                    metrics.observe_state(&self.model.stats(), active, failed);
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{InMemoryFilestore, MemoryStore};
    use crate::multishare::constraints::{GIB, PARAM_STORAGE_CLASS_ID, TIB};
    use assert_matches::assert_matches;

    struct Fixture {
        controller: Arc<MultishareController>,
        backend: Arc<InMemoryFilestore>,
        store: Arc<MemoryStore>,
    }

    fn fixture(config: ControllerConfig) -> Fixture {
        let backend = Arc::new(InMemoryFilestore::new(1));
        let store = Arc::new(MemoryStore::new());
        let controller =
            MultishareController::new(config, backend.clone(), store.clone(), None).unwrap();
        Fixture {
            controller,
            backend,
            store,
        }
    }

    /// Reconcile until no operation is active
    async fn settle(controller: &MultishareController) {
        let mut now = Utc::now();
        for _ in 0..40 {
            controller.reconciler().reconcile_once(now).await;
            if controller.registry().counts().0 == 0 {
                return;
            }
            now += chrono::Duration::seconds(120);
        }
        panic!("operations did not settle");
    }

    fn request(name: &str, bytes: u64) -> ShareRequest {
        ShareRequest::new(name, bytes, "p", "us-central1")
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
constraints:
  maxSharesPerInstance: 5
packing:
  order: LeastFullFirst
reconciler:
  initialPollMs: 500
"#;
        let config = ControllerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.constraints.max_shares_per_instance, 5);
        assert_eq!(config.constraints.min_instance_size, TIB);
        assert_eq!(config.packing.order, PlacementOrder::LeastFullFirst);
        assert!(config.packing.allow_grow);
        assert_eq!(config.reconciler.initial_poll_ms, 500);

        assert_matches!(
            ControllerConfig::from_yaml_str("constraints:\n  stepSize: 0\n"),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.yaml");
        std::fs::write(&path, "packing:\n  allowGrow: false\n").unwrap();
        let config = ControllerConfig::from_yaml_file(&path).unwrap();
        assert!(!config.packing.allow_grow);

        assert_matches!(
            ControllerConfig::from_yaml_file(dir.path().join("missing.yaml")),
            Err(Error::Io(_))
        );
    }

    #[tokio::test]
    async fn test_first_share_creates_instance() {
        let f = fixture(ControllerConfig::default());
        let provisioned = f.controller.create_share(request("pvc-1", 100 * GIB)).await.unwrap();

        assert_eq!(provisioned.placement, "new_instance");
        assert_eq!(provisioned.state, LifecycleState::Pending);
        assert!(provisioned.volume_id.starts_with("modeMultishare/default/p/us-central1/fs-"));
        let volume: VolumeId = provisioned.volume_id.parse().unwrap();
        assert_eq!(volume.share, provisioned.share);

        // Nothing debited until the create completes
        let instance = f.controller.model().instance(&provisioned.instance).unwrap();
        assert_eq!(instance.total_capacity, TIB);
        assert_eq!(instance.consumed_capacity(), 0);
        assert!(f
            .store
            .has_finalizer(&ResourceKey::Share(provisioned.share.clone()))
            .await
            .unwrap());

        settle(&f.controller).await;
        let instance = f.controller.model().instance(&provisioned.instance).unwrap();
        assert_eq!(instance.state, LifecycleState::Ready);
        assert_eq!(instance.consumed_capacity(), 100 * GIB);
        assert_eq!(
            f.backend.share_capacity(&provisioned.share),
            Some(100 * GIB)
        );
    }

    #[tokio::test]
    async fn test_repeat_create_is_idempotent() {
        let f = fixture(ControllerConfig::default());
        let first = f.controller.create_share(request("pvc-1", 100 * GIB)).await.unwrap();
        let again = f.controller.create_share(request("pvc-1", 100 * GIB)).await.unwrap();
        assert_eq!(again.placement, "already_exists");
        assert_eq!(again.share, first.share);
        assert_eq!(again.operation, first.operation);

        assert_matches!(
            f.controller.create_share(request("pvc-1", 200 * GIB)).await,
            Err(Error::Validation(_))
        );
        assert_eq!(f.controller.model().stats().shares, 1);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_and_bad_names() {
        let f = fixture(ControllerConfig::default());
        assert_matches!(
            f.controller.create_share(request("pvc-1", 1536 * GIB)).await,
            Err(Error::Validation(_))
        );
        assert_matches!(
            f.controller.create_share(request("a/b", 100 * GIB)).await,
            Err(Error::Validation(_))
        );
        assert_eq!(f.controller.registry().counts(), (0, 0));
        assert_eq!(f.controller.model().stats().instances, 0);
    }

    #[tokio::test]
    async fn test_rejects_storage_class_with_separator() {
        let f = fixture(ControllerConfig::default());
        let mut req = request("pvc-1", 100 * GIB);
        req.parameters
            .insert(PARAM_STORAGE_CLASS_ID.to_string(), "team/a".to_string());
        assert_matches!(f.controller.create_share(req).await, Err(Error::Validation(_)));
        assert_eq!(f.controller.registry().counts(), (0, 0));
        assert_eq!(f.controller.model().stats().instances, 0);
        assert_eq!(f.backend.started(), 0);
    }

    #[tokio::test]
    async fn test_stale_placement_is_abandoned() {
        let f = fixture(ControllerConfig::default());
        let first = f.controller.create_share(request("pvc-1", 900 * GIB)).await.unwrap();
        settle(&f.controller).await;
        let instance_key = ResourceKey::Instance(first.instance.clone());

        // Room a placement snapshot saw before pvc-1 was debited
        let req = request("pvc-2", 200 * GIB);
        let constraints = f.controller.allocator.effective_constraints(&req).unwrap();
        let stale = PlacementDecision::Existing {
            instance: first.instance.clone(),
        };
        let outcome = f
            .controller
            .commit(&req, &constraints, "default", &stale)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(f.controller.registry().counts(), (0, 0));
        assert!(!f.controller.registry().is_busy(&instance_key));
        assert_eq!(f.controller.model().stats().shares, 1);

        let grow = |new_capacity| PlacementDecision::Grow {
            instance: first.instance.clone(),
            new_capacity,
        };
        assert!(f.controller.still_fits(&grow(2 * TIB), 200 * GIB, &constraints));
        assert!(!f.controller.still_fits(&grow(3 * TIB), 200 * GIB, &constraints));
        // Fits without growing now
        assert!(!f.controller.still_fits(&grow(2 * TIB), 100 * GIB, &constraints));

        let placed = f.controller.create_share(req).await.unwrap();
        assert_eq!(placed.placement, "grow");
    }

    #[tokio::test]
    async fn test_failed_writes_restore_share_state() {
        let f = fixture(ControllerConfig::default());
        let a = f.controller.create_share(request("pvc-1", 600 * GIB)).await.unwrap();
        settle(&f.controller).await;
        f.controller.create_share(request("pvc-2", 300 * GIB)).await.unwrap();
        settle(&f.controller).await;
        let key = ResourceKey::Share(a.share.clone());

        f.store.fail_next_write(key.clone());
        assert_matches!(
            f.controller.delete_share(&a.volume_id).await,
            Err(Error::Backend { .. })
        );
        assert_eq!(
            f.controller.model().share(&a.share).unwrap().state,
            LifecycleState::Ready
        );
        assert_eq!(f.controller.registry().counts(), (0, 0));

        // Needs the instance grown first
        f.store.fail_next_write(key);
        assert_matches!(
            f.controller
                .expand_share(&a.volume_id, 800 * GIB, &BTreeMap::new())
                .await,
            Err(Error::Backend { .. })
        );
        let share = f.controller.model().share(&a.share).unwrap();
        assert_eq!(share.state, LifecycleState::Ready);
        assert_eq!(share.capacity, 600 * GIB);
        let instance = f.controller.model().instance(&a.instance).unwrap();
        assert_eq!(instance.state, LifecycleState::Ready);
        assert_eq!(instance.total_capacity, TIB);
        assert_eq!(f.controller.registry().counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_busy_instance_is_skipped() {
        let f = fixture(ControllerConfig::default());
        let first = f.controller.create_share(request("pvc-1", 100 * GIB)).await.unwrap();
        settle(&f.controller).await;

        let second = f.controller.create_share(request("pvc-2", 100 * GIB)).await.unwrap();
        assert_eq!(second.placement, "existing");
        assert_eq!(second.instance, first.instance);

        // The instance is held by pvc-2's create, so pvc-3 goes elsewhere
        let third = f.controller.create_share(request("pvc-3", 100 * GIB)).await.unwrap();
        assert_eq!(third.placement, "new_instance");
        assert_ne!(third.instance, first.instance);
    }

    #[tokio::test]
    async fn test_grow_then_place() {
        let f = fixture(ControllerConfig::default());
        let first = f.controller.create_share(request("pvc-1", 1024 * GIB)).await.unwrap();
        settle(&f.controller).await;

        let grown = f.controller.create_share(request("pvc-2", 100 * GIB)).await.unwrap();
        assert_eq!(grown.placement, "grow");
        assert_eq!(grown.instance, first.instance);
        assert_eq!(
            f.controller.model().instance(&first.instance).unwrap().state,
            LifecycleState::Updating
        );

        settle(&f.controller).await;
        let instance = f.controller.model().instance(&first.instance).unwrap();
        assert_eq!(instance.total_capacity, 2 * TIB);
        assert_eq!(instance.consumed_capacity(), 1124 * GIB);
        assert_eq!(instance.state, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_delete_flow() {
        let f = fixture(ControllerConfig::default());
        let provisioned = f.controller.create_share(request("pvc-1", 100 * GIB)).await.unwrap();
        settle(&f.controller).await;

        let outcome = f.controller.delete_share(&provisioned.volume_id).await.unwrap();
        assert_matches!(outcome, DeleteOutcome::Pending { .. });
        assert_matches!(
            f.controller.delete_share(&provisioned.volume_id).await,
            Err(Error::Conflict { .. })
        );

        settle(&f.controller).await;
        assert!(f.controller.model().share(&provisioned.share).is_none());
        assert!(f.store.load_shares().await.unwrap().is_empty());
        // Empty instance reclaimed on the same pass chain
        assert!(f.controller.model().instance(&provisioned.instance).is_none());

        assert_eq!(
            f.controller.delete_share(&provisioned.volume_id).await.unwrap(),
            DeleteOutcome::AlreadyDeleted
        );
    }

    #[tokio::test]
    async fn test_delete_rejects_malformed_volume_id() {
        let f = fixture(ControllerConfig::default());
        assert_matches!(
            f.controller.delete_share("modeMultishare/default/p/l/fs-1").await,
            Err(Error::MalformedIdentity { .. })
        );
        assert_matches!(
            f.controller.delete_share("modeInstance/default/p/l/fs-1/a").await,
            Err(Error::MalformedIdentity { .. })
        );
    }

    #[tokio::test]
    async fn test_expand_within_headroom() {
        let f = fixture(ControllerConfig::default());
        let provisioned = f.controller.create_share(request("pvc-1", 100 * GIB)).await.unwrap();
        settle(&f.controller).await;

        let params = BTreeMap::new();
        assert_matches!(
            f.controller.expand_share(&provisioned.volume_id, 50 * GIB, &params).await,
            Err(Error::Validation(_))
        );
        assert_eq!(
            f.controller
                .expand_share(&provisioned.volume_id, 100 * GIB, &params)
                .await
                .unwrap(),
            ExpandOutcome::Unchanged {
                capacity_bytes: 100 * GIB
            }
        );

        let outcome = f
            .controller
            .expand_share(&provisioned.volume_id, 500 * GIB, &params)
            .await
            .unwrap();
        assert_matches!(
            outcome,
            ExpandOutcome::Pending {
                instance_capacity: None,
                ..
            }
        );
        settle(&f.controller).await;
        assert_eq!(
            f.controller.model().share(&provisioned.share).unwrap().capacity,
            500 * GIB
        );
    }

    #[tokio::test]
    async fn test_expand_grows_instance() {
        let f = fixture(ControllerConfig::default());
        let a = f.controller.create_share(request("pvc-1", 600 * GIB)).await.unwrap();
        settle(&f.controller).await;
        f.controller.create_share(request("pvc-2", 400 * GIB)).await.unwrap();
        settle(&f.controller).await;

        let outcome = f
            .controller
            .expand_share(&a.volume_id, 900 * GIB, &BTreeMap::new())
            .await
            .unwrap();
        assert_matches!(
            outcome,
            ExpandOutcome::Pending {
                instance_capacity: Some(c),
                ..
            } if c == 2 * TIB
        );
        settle(&f.controller).await;
        let instance = f.controller.model().instance(&a.instance).unwrap();
        assert_eq!(instance.total_capacity, 2 * TIB);
        assert_eq!(instance.consumed_capacity(), 1300 * GIB);
    }

    #[tokio::test]
    async fn test_failed_create_can_be_retried() {
        let f = fixture(ControllerConfig::default());
        let first = f.controller.create_share(request("pvc-1", 100 * GIB)).await.unwrap();
        settle(&f.controller).await;

        let second = f.controller.create_share(request("pvc-2", 100 * GIB)).await.unwrap();
        f.backend
            .fail_target(ResourceKey::Share(second.share.clone()), "quota exceeded");
        settle(&f.controller).await;
        assert_eq!(
            f.controller.model().share(&second.share).unwrap().state,
            LifecycleState::Error
        );
        assert_eq!(f.controller.registry().counts(), (0, 1));

        f.backend.clear_faults();
        let retried = f.controller.create_share(request("pvc-2", 100 * GIB)).await.unwrap();
        assert_eq!(retried.instance, first.instance);
        settle(&f.controller).await;
        assert_eq!(
            f.controller.model().share(&second.share).unwrap().state,
            LifecycleState::Ready
        );
    }

    #[tokio::test]
    async fn test_rebuild_resumes_chained_create() {
        let backend = Arc::new(InMemoryFilestore::new(1));
        let store = Arc::new(MemoryStore::new());
        let before = MultishareController::new(
            ControllerConfig::default(),
            backend.clone(),
            store.clone(),
            None,
        )
        .unwrap();
        let provisioned = before.create_share(request("pvc-1", 100 * GIB)).await.unwrap();
        // Issue the instance create, then "crash"
        before.reconciler().reconcile_once(Utc::now()).await;
        drop(before);

        let after =
            MultishareController::new(ControllerConfig::default(), backend.clone(), store, None)
                .unwrap();
        let report = after.rebuild().await.unwrap();
        assert_eq!(report.instances, 1);
        assert_eq!(report.shares, 1);
        assert_eq!(report.operations, 1);
        assert_eq!(report.reissued, 1);

        settle(&after).await;
        let share = after.model().share(&provisioned.share).unwrap();
        assert_eq!(share.state, LifecycleState::Ready);
        assert_eq!(
            after.model().instance(&provisioned.instance).unwrap().consumed_capacity(),
            100 * GIB
        );
        assert_eq!(backend.share_capacity(&provisioned.share), Some(100 * GIB));
    }

    #[tokio::test]
    async fn test_status() {
        let f = fixture(ControllerConfig::default());
        f.controller.create_share(request("pvc-1", 100 * GIB)).await.unwrap();
        let status = f.controller.status();
        assert_eq!(status.active_operations, 1);
        assert_eq!(status.model.instances, 1);
        assert_eq!(status.placement_order, PlacementOrder::MostFullFirst);
        assert_eq!(f.controller.operations().len(), 1);
        assert_eq!(f.controller.instances()[0].max_shares, 10);
    }
}
