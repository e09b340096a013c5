//! Operation Registry
//!
//! Tracks every in-flight asynchronous lifecycle operation against instances
//! and shares. At most one non-terminal operation may hold a resource key at
//! a time; share operations also hold their owning instance's key so the
//! instance stays out of placement while they run.

use crate::error::{Error, Result};
use crate::multishare::identity::ResourceKey;
use crate::multishare::timefmt::{format_op_time, parse_op_time};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// How long a failed operation stays queryable before eviction
pub const ERR_RETENTION: Duration = Duration::from_secs(15 * 60);

pub const OP_VERB_CREATE: &str = "create";
pub const OP_VERB_DELETE: &str = "delete";
pub const OP_VERB_UPDATE: &str = "update";

// =============================================================================
// Operation Type / Status
// =============================================================================

/// Kind of resource an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Instance,
    Share,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Instance => "instance",
            ResourceKind::Share => "share",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle action tracked by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    InstanceCreate,
    InstanceDelete,
    InstanceUpdate,
    ShareCreate,
    ShareDelete,
    ShareUpdate,
    /// Anything that did not map to a known (kind, verb) pair
    Unknown,
}

impl OperationType {
    pub const ALL_KNOWN: [OperationType; 6] = [
        OperationType::InstanceCreate,
        OperationType::InstanceDelete,
        OperationType::InstanceUpdate,
        OperationType::ShareCreate,
        OperationType::ShareDelete,
        OperationType::ShareUpdate,
    ];

    /// Map a (kind, verb) pair; unmapped verbs yield `Unknown`
    pub fn from_verb(kind: ResourceKind, verb: &str) -> Self {
        match (kind, verb) {
            (ResourceKind::Instance, OP_VERB_CREATE) => OperationType::InstanceCreate,
            (ResourceKind::Instance, OP_VERB_DELETE) => OperationType::InstanceDelete,
            (ResourceKind::Instance, OP_VERB_UPDATE) => OperationType::InstanceUpdate,
            (ResourceKind::Share, OP_VERB_CREATE) => OperationType::ShareCreate,
            (ResourceKind::Share, OP_VERB_DELETE) => OperationType::ShareDelete,
            (ResourceKind::Share, OP_VERB_UPDATE) => OperationType::ShareUpdate,
            _ => OperationType::Unknown,
        }
    }

    pub fn kind(&self) -> Option<ResourceKind> {
        match self {
            OperationType::InstanceCreate
            | OperationType::InstanceDelete
            | OperationType::InstanceUpdate => Some(ResourceKind::Instance),
            OperationType::ShareCreate | OperationType::ShareDelete | OperationType::ShareUpdate => {
                Some(ResourceKind::Share)
            }
            OperationType::Unknown => None,
        }
    }

    pub fn verb(&self) -> Option<&'static str> {
        match self {
            OperationType::InstanceCreate | OperationType::ShareCreate => Some(OP_VERB_CREATE),
            OperationType::InstanceDelete | OperationType::ShareDelete => Some(OP_VERB_DELETE),
            OperationType::InstanceUpdate | OperationType::ShareUpdate => Some(OP_VERB_UPDATE),
            OperationType::Unknown => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, OperationType::InstanceDelete | OperationType::ShareDelete)
    }

    /// Wire string, e.g. `instancecreate`
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::InstanceCreate => "instancecreate",
            OperationType::InstanceDelete => "instancedelete",
            OperationType::InstanceUpdate => "instanceupdate",
            OperationType::ShareCreate => "sharecreate",
            OperationType::ShareDelete => "sharedelete",
            OperationType::ShareUpdate => "shareupdate",
            OperationType::Unknown => "unknown",
        }
    }

    /// Total inverse of [`OperationType::as_str`]
    pub fn parse(s: &str) -> Self {
        Self::ALL_KNOWN
            .into_iter()
            .find(|t| t.as_str() == s)
            .unwrap_or(OperationType::Unknown)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::Unknown => "unknown",
        }
    }

    /// Total parse; unrecognized input is `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => OperationStatus::Running,
            "succeeded" => OperationStatus::Succeeded,
            "failed" => OperationStatus::Failed,
            _ => OperationStatus::Unknown,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Intent
// =============================================================================

/// A request to run one lifecycle operation, optionally chained to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub target: ResourceKey,
    pub op_type: OperationType,
    /// Desired capacity for create/update, current capacity for delete
    pub capacity_bytes: u64,
    /// Issued once this intent's operation succeeds
    pub then: Option<Box<Intent>>,
}

impl Intent {
    pub fn new(target: impl Into<ResourceKey>, op_type: OperationType, capacity_bytes: u64) -> Self {
        Self {
            target: target.into(),
            op_type,
            capacity_bytes,
            then: None,
        }
    }

    /// Chain a follow-up to the end of this intent
    pub fn then(mut self, next: Intent) -> Self {
        match self.then.take() {
            Some(existing) => self.then = Some(Box::new((*existing).then(next))),
            None => self.then = Some(Box::new(next)),
        }
        self
    }

    fn validate(&self) -> Result<()> {
        match self.op_type.kind() {
            None => Err(Error::UnknownState {
                resource: self.target.to_string(),
                detail: "cannot register an unknown operation type".into(),
            }),
            Some(kind) if kind != self.target.kind() => Err(Error::Validation(format!(
                "{} cannot target {} {}",
                self.op_type,
                self.target.kind(),
                self.target
            ))),
            Some(_) => self.then.as_ref().map_or(Ok(()), |next| next.validate()),
        }
    }

    /// Keys held while this intent (and its chain) is outstanding
    fn exclusion_keys(&self) -> BTreeSet<ResourceKey> {
        let mut keys = BTreeSet::new();
        let mut cursor = Some(self);
        while let Some(intent) = cursor {
            keys.insert(intent.target.clone());
            keys.insert(ResourceKey::Instance(intent.target.instance().clone()));
            cursor = intent.then.as_deref();
        }
        keys
    }
}

// =============================================================================
// Operation
// =============================================================================

/// Registry-local operation handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{:08x}", self.0)
    }
}

/// A tracked lifecycle operation
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub target: ResourceKey,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub capacity_bytes: u64,
    /// Backend long-running-operation name, once issued
    pub backend_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
    pub unknown_since: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub then: Option<Box<Intent>>,
    /// Backend reported success; completion writes are still outstanding
    pub completing: bool,
    claims: Vec<ResourceKey>,
}

impl Operation {
    /// Time after which a failed operation may be evicted
    pub fn retention_deadline(&self, retention: chrono::Duration) -> Option<DateTime<Utc>> {
        self.failed_at.map(|t| t + retention)
    }

    /// Intent that would re-issue this operation
    pub fn intent(&self) -> Intent {
        Intent {
            target: self.target.clone(),
            op_type: self.op_type,
            capacity_bytes: self.capacity_bytes,
            then: self.then.clone(),
        }
    }

    /// Serializable form handed to the persistence collaborator
    pub fn to_record(&self) -> OperationRecord {
        OperationRecord {
            op_type: self.op_type.as_str().to_string(),
            status: self.status.as_str().to_string(),
            capacity_bytes: self.capacity_bytes,
            backend_name: self.backend_name.clone(),
            start_time: format_op_time(&self.start_time),
            last_observed: format_op_time(&self.last_observed),
            unknown_since: self.unknown_since.as_ref().map(format_op_time),
            failed_at: self.failed_at.as_ref().map(format_op_time),
            error: self.error.clone(),
        }
    }
}

/// Persisted operation state, timestamps in the operation layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub op_type: String,
    pub status: String,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub backend_name: Option<String>,
    pub start_time: String,
    pub last_observed: String,
    #[serde(default)]
    pub unknown_since: Option<String>,
    #[serde(default)]
    pub failed_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Result of applying an observation
#[derive(Debug, Clone)]
pub struct Observed {
    /// Operation state after the observation
    pub operation: Operation,
    pub previous: OperationStatus,
    /// Chained operation registered on success
    pub follow_up: Option<OperationId>,
}

// =============================================================================
// Operation Registry
// =============================================================================

/// Concurrent registry of lifecycle operations
pub struct OperationRegistry {
    ops: DashMap<OperationId, Operation>,
    /// Resource key -> non-terminal operation holding it
    claims: DashMap<ResourceKey, OperationId>,
    next_id: AtomicU64,
    retention: chrono::Duration,
}

impl OperationRegistry {
    /// Create a registry with the standard failure retention window
    pub fn new() -> Self {
        let retention =
            chrono::Duration::from_std(ERR_RETENTION).unwrap_or_else(|_| chrono::Duration::minutes(15));
        Self::with_retention(retention)
    }

    pub fn with_retention(retention: chrono::Duration) -> Self {
        Self {
            ops: DashMap::new(),
            claims: DashMap::new(),
            next_id: AtomicU64::new(1),
            retention,
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    fn allocate_id(&self) -> OperationId {
        OperationId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Claim every key for `id`, or none of them
    fn claim(&self, id: OperationId, keys: &BTreeSet<ResourceKey>) -> Result<Vec<ResourceKey>> {
        let mut taken: Vec<ResourceKey> = Vec::with_capacity(keys.len());
        for key in keys {
            let holder = match self.claims.entry(key.clone()) {
                Entry::Occupied(e) => *e.get(),
                Entry::Vacant(v) => {
                    v.insert(id);
                    taken.push(key.clone());
                    continue;
                }
            };

            self.release(id, &taken);
            let existing = self
                .ops
                .get(&holder)
                .map(|op| op.op_type.to_string())
                .unwrap_or_else(|| holder.to_string());
            return Err(Error::Conflict {
                resource: key.to_string(),
                existing,
            });
        }
        Ok(taken)
    }

    fn release(&self, id: OperationId, keys: &[ResourceKey]) {
        for key in keys {
            self.claims.remove_if(key, |_, holder| *holder == id);
        }
    }

    /// Register an intent as a new running operation
    ///
    /// Fails with `Conflict` when any key the intent needs is held by a
    /// non-terminal operation.
    pub fn register(&self, intent: Intent, now: DateTime<Utc>) -> Result<OperationId> {
        intent.validate()?;
        let id = self.allocate_id();
        let claims = self.claim(id, &intent.exclusion_keys())?;

        let op = Operation {
            id,
            target: intent.target,
            op_type: intent.op_type,
            status: OperationStatus::Running,
            capacity_bytes: intent.capacity_bytes,
            backend_name: None,
            start_time: now,
            last_observed: now,
            unknown_since: None,
            failed_at: None,
            error: None,
            then: intent.then,
            completing: false,
            claims,
        };

        info!("Registered {} {} for {}", id, op.op_type, op.target);
        self.ops.insert(id, op);
        Ok(id)
    }

    /// Re-create an operation from its persisted record after a restart
    pub fn restore(&self, target: ResourceKey, record: &OperationRecord) -> Result<OperationId> {
        let op_type = OperationType::parse(&record.op_type);
        let status = OperationStatus::parse(&record.status);
        let intent = Intent::new(target.clone(), op_type, record.capacity_bytes);
        intent.validate()?;

        if status == OperationStatus::Succeeded {
            return Err(Error::Validation(format!(
                "refusing to restore completed operation for {}",
                target
            )));
        }

        let id = self.allocate_id();
        let claims = if status == OperationStatus::Failed {
            Vec::new()
        } else {
            self.claim(id, &intent.exclusion_keys())?
        };

        let op = Operation {
            id,
            target,
            op_type,
            status,
            capacity_bytes: record.capacity_bytes,
            backend_name: record.backend_name.clone(),
            start_time: parse_op_time(&record.start_time)?,
            last_observed: parse_op_time(&record.last_observed)?,
            unknown_since: record.unknown_since.as_deref().map(parse_op_time).transpose()?,
            failed_at: record.failed_at.as_deref().map(parse_op_time).transpose()?,
            error: record.error.clone(),
            then: None,
            completing: false,
            claims,
        };

        debug!("Restored {} {} for {} ({})", id, op.op_type, op.target, op.status);
        self.ops.insert(id, op);
        Ok(id)
    }

    /// Chain a follow-up onto the active operation targeting `key`
    pub fn attach_follow_up(&self, key: &ResourceKey, next: Intent) -> Result<OperationId> {
        next.validate()?;
        let id = self
            .active_for(key)
            .map(|op| op.id)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Operation".into(),
                name: key.to_string(),
            })?;

        let wanted = next.exclusion_keys();
        let held: BTreeSet<ResourceKey> = self
            .ops
            .get(&id)
            .map(|op| op.claims.iter().cloned().collect())
            .unwrap_or_default();
        let missing: BTreeSet<ResourceKey> = wanted.difference(&held).cloned().collect();
        let taken = self.claim(id, &missing)?;

        let mut op = self.ops.get_mut(&id).ok_or_else(|| Error::ResourceNotFound {
            kind: "Operation".into(),
            name: id.to_string(),
        })?;
        op.claims.extend(taken);
        let chained = match op.then.take() {
            Some(existing) => (*existing).then(next),
            None => next,
        };
        op.then = Some(Box::new(chained));
        Ok(id)
    }

    /// Record the backend operation name once the call was issued
    pub(crate) fn mark_started(&self, id: OperationId, backend_name: String, now: DateTime<Utc>) {
        if let Some(mut op) = self.ops.get_mut(&id) {
            op.backend_name = Some(backend_name);
            op.last_observed = now;
        }
    }

    /// Record a backend success whose completion has not been applied yet
    ///
    /// The operation stays non-terminal and keeps its claims, so nothing can
    /// contend for its resources until [`OperationRegistry::observe`] settles it.
    pub(crate) fn mark_completing(&self, id: OperationId, now: DateTime<Utc>) -> Result<Operation> {
        let mut op = self.ops.get_mut(&id).ok_or_else(|| Error::ResourceNotFound {
            kind: "Operation".into(),
            name: id.to_string(),
        })?;
        if op.status.is_terminal() {
            return Err(Error::Internal(format!("{} is already {}", id, op.status)));
        }
        op.completing = true;
        op.status = OperationStatus::Running;
        op.unknown_since = None;
        op.last_observed = now;
        Ok(op.clone())
    }

    /// Apply an observed status. Only the reconciler drives this.
    pub(crate) fn observe(
        &self,
        id: OperationId,
        status: OperationStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Observed> {
        let mut entry = self.ops.get_mut(&id).ok_or_else(|| Error::ResourceNotFound {
            kind: "Operation".into(),
            name: id.to_string(),
        })?;

        let previous = entry.status;
        if previous.is_terminal() {
            return Ok(Observed {
                operation: entry.clone(),
                previous,
                follow_up: None,
            });
        }

        entry.last_observed = now;
        match status {
            OperationStatus::Running => {
                entry.status = OperationStatus::Running;
                entry.unknown_since = None;
                Ok(Observed {
                    operation: entry.clone(),
                    previous,
                    follow_up: None,
                })
            }
            OperationStatus::Unknown => {
                if previous != OperationStatus::Unknown {
                    warn!("{} {} on {} entered unknown state", id, entry.op_type, entry.target);
                    entry.unknown_since = Some(now);
                }
                entry.status = OperationStatus::Unknown;
                Ok(Observed {
                    operation: entry.clone(),
                    previous,
                    follow_up: None,
                })
            }
            OperationStatus::Failed => {
                entry.status = OperationStatus::Failed;
                entry.failed_at = Some(now);
                entry.error = error;
                let claims = std::mem::take(&mut entry.claims);
                let snapshot = entry.clone();
                drop(entry);

                self.release(id, &claims);
                warn!(
                    "{} {} on {} failed: {}",
                    id,
                    snapshot.op_type,
                    snapshot.target,
                    snapshot.error.as_deref().unwrap_or("no detail")
                );
                Ok(Observed {
                    operation: snapshot,
                    previous,
                    follow_up: None,
                })
            }
            OperationStatus::Succeeded => {
                drop(entry);
                let Some((_, mut done)) = self.ops.remove(&id) else {
                    return Err(Error::Internal(format!("{} vanished while completing", id)));
                };
                done.status = OperationStatus::Succeeded;
                let claims = std::mem::take(&mut done.claims);

                let follow_up = match done.then.take() {
                    Some(next) => match self.hand_over(id, claims, *next, now) {
                        Ok(next_id) => Some(next_id),
                        Err(e) => {
                            warn!("{} succeeded but its follow-up could not be registered: {}", id, e);
                            None
                        }
                    },
                    None => {
                        self.release(id, &claims);
                        None
                    }
                };

                info!("{} {} on {} succeeded", id, done.op_type, done.target);
                Ok(Observed {
                    operation: done,
                    previous,
                    follow_up,
                })
            }
        }
    }

    /// Move claims from a finished operation to its follow-up without a gap
    fn hand_over(
        &self,
        from: OperationId,
        claims: Vec<ResourceKey>,
        next: Intent,
        now: DateTime<Utc>,
    ) -> Result<OperationId> {
        let id = self.allocate_id();
        let wanted = next.exclusion_keys();

        let mut kept = Vec::new();
        for key in claims {
            if wanted.contains(&key) {
                if let Some(mut holder) = self.claims.get_mut(&key) {
                    if *holder == from {
                        *holder = id;
                        kept.push(key);
                    }
                }
            } else {
                self.claims.remove_if(&key, |_, holder| *holder == from);
            }
        }
        let missing: BTreeSet<ResourceKey> = wanted
            .into_iter()
            .filter(|k| !kept.contains(k))
            .collect();
        match self.claim(id, &missing) {
            Ok(taken) => kept.extend(taken),
            Err(e) => {
                self.release(id, &kept);
                return Err(e);
            }
        }

        let op = Operation {
            id,
            target: next.target,
            op_type: next.op_type,
            status: OperationStatus::Running,
            capacity_bytes: next.capacity_bytes,
            backend_name: None,
            start_time: now,
            last_observed: now,
            unknown_since: None,
            failed_at: None,
            error: None,
            then: next.then,
            completing: false,
            claims: kept,
        };
        info!("Registered follow-up {} {} for {}", id, op.op_type, op.target);
        self.ops.insert(id, op);
        Ok(id)
    }

    /// Drop an operation that was never issued to the backend
    pub(crate) fn abandon(&self, id: OperationId) -> Result<()> {
        let Some((_, op)) = self.ops.remove_if(&id, |_, op| op.backend_name.is_none()) else {
            return Err(Error::Internal(format!("{} cannot be abandoned", id)));
        };
        self.release(id, &op.claims);
        debug!("Abandoned {} {} for {}", id, op.op_type, op.target);
        Ok(())
    }

    /// Get an operation by handle
    pub fn get(&self, id: OperationId) -> Option<Operation> {
        self.ops.get(&id).map(|op| op.clone())
    }

    /// Non-terminal operation currently holding `key`
    pub fn active_for(&self, key: &ResourceKey) -> Option<Operation> {
        let id = *self.claims.get(key)?;
        self.get(id).filter(|op| !op.status.is_terminal())
    }

    /// Whether any non-terminal operation holds `key`
    pub fn is_busy(&self, key: &ResourceKey) -> bool {
        self.claims.contains_key(key)
    }

    /// Most recent failed operation targeting `key`, if still retained
    pub fn failed_for(&self, key: &ResourceKey) -> Option<Operation> {
        self.ops
            .iter()
            .filter(|op| op.status == OperationStatus::Failed && &op.target == key)
            .max_by_key(|op| op.id)
            .map(|op| op.clone())
    }

    /// Lazy, restartable sequence of non-terminal operations
    pub fn list_active(&self) -> ActiveOperations<'_> {
        let mut ids: Vec<OperationId> = self
            .ops
            .iter()
            .filter(|op| !op.status.is_terminal())
            .map(|op| op.id)
            .collect();
        ids.sort();
        ActiveOperations {
            registry: self,
            ids,
            pos: 0,
        }
    }

    /// Failed operations still within their retention window
    pub fn list_failed(&self) -> Vec<Operation> {
        let mut failed: Vec<Operation> = self
            .ops
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .map(|op| op.clone())
            .collect();
        failed.sort_by_key(|op| op.id);
        failed
    }

    /// Drop failed operations strictly past their retention deadline
    pub fn evict_expired(&self, now: DateTime<Utc>) -> Vec<Operation> {
        let expired: Vec<OperationId> = self
            .ops
            .iter()
            .filter(|op| {
                op.retention_deadline(self.retention)
                    .is_some_and(|deadline| now > deadline)
            })
            .map(|op| op.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.ops.remove(&id).map(|(_, op)| op))
            .inspect(|op| debug!("Evicted failed {} for {}", op.id, op.target))
            .collect()
    }

    /// Counts of (non-terminal, retained failed) operations
    pub fn counts(&self) -> (usize, usize) {
        self.ops.iter().fold((0, 0), |(active, failed), op| match op.status {
            OperationStatus::Failed => (active, failed + 1),
            s if !s.is_terminal() => (active + 1, failed),
            _ => (active, failed),
        })
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over active operations; entries are fetched lazily and skipped
/// if they turned terminal after the snapshot was taken.
pub struct ActiveOperations<'a> {
    registry: &'a OperationRegistry,
    ids: Vec<OperationId>,
    pos: usize,
}

impl ActiveOperations<'_> {
    /// Start again from the first operation of the snapshot
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for ActiveOperations<'_> {
    type Item = Operation;

    fn next(&mut self) -> Option<Operation> {
        while let Some(id) = self.ids.get(self.pos).copied() {
            self.pos += 1;
            if let Some(op) = self.registry.get(id).filter(|op| !op.status.is_terminal()) {
                return Some(op);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multishare::identity::{InstanceHandle, ShareHandle};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn instance(name: &str) -> InstanceHandle {
        InstanceHandle::new("p", "us-central1", name)
    }

    fn share(inst: &str, name: &str) -> ShareHandle {
        instance(inst).share(name)
    }

    #[test]
    fn test_operation_type_round_trip() {
        for kind in [ResourceKind::Instance, ResourceKind::Share] {
            for verb in [OP_VERB_CREATE, OP_VERB_DELETE, OP_VERB_UPDATE] {
                let t = OperationType::from_verb(kind, verb);
                assert_ne!(t, OperationType::Unknown);
                assert_eq!(t.kind(), Some(kind));
                assert_eq!(t.verb(), Some(verb));
                assert_eq!(OperationType::parse(t.as_str()), t);
                assert_eq!(t.to_string(), format!("{}{}", kind, verb));
            }
        }
    }

    #[test]
    fn test_unrecognized_verb_is_unknown() {
        assert_eq!(
            OperationType::from_verb(ResourceKind::Share, "resize"),
            OperationType::Unknown
        );
        assert_eq!(OperationType::parse("sharemigrate"), OperationType::Unknown);
        assert_eq!(OperationType::parse(""), OperationType::Unknown);
        assert_eq!(OperationStatus::parse("DONE"), OperationStatus::Unknown);
    }

    #[test]
    fn test_register_rejects_unknown_and_mismatched_types() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        assert_matches!(
            reg.register(Intent::new(instance("a"), OperationType::Unknown, 0), now),
            Err(Error::UnknownState { .. })
        );
        assert_matches!(
            reg.register(Intent::new(instance("a"), OperationType::ShareCreate, 0), now),
            Err(Error::Validation(_))
        );
        assert_eq!(reg.counts(), (0, 0));
    }

    #[test]
    fn test_conflict_on_same_target() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        let s = share("fs-1", "pvc-1");

        reg.register(Intent::new(s.clone(), OperationType::ShareDelete, 0), now)
            .unwrap();
        assert_matches!(
            reg.register(Intent::new(s.clone(), OperationType::ShareDelete, 0), now),
            Err(Error::Conflict { .. })
        );
        assert_eq!(reg.counts(), (1, 0));
    }

    #[test]
    fn test_share_operation_holds_instance() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        reg.register(
            Intent::new(share("fs-1", "a"), OperationType::ShareCreate, 100),
            now,
        )
        .unwrap();

        assert!(reg.is_busy(&ResourceKey::Instance(instance("fs-1"))));
        assert_matches!(
            reg.register(
                Intent::new(share("fs-1", "b"), OperationType::ShareCreate, 100),
                now
            ),
            Err(Error::Conflict { .. })
        );
        // Different instance does not contend
        reg.register(
            Intent::new(share("fs-2", "b"), OperationType::ShareCreate, 100),
            now,
        )
        .unwrap();
    }

    #[test]
    fn test_failed_conflict_leaves_no_partial_claims() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        reg.register(Intent::new(instance("fs-1"), OperationType::InstanceUpdate, 2), now)
            .unwrap();

        let s = share("fs-1", "a");
        assert!(reg
            .register(Intent::new(s.clone(), OperationType::ShareCreate, 1), now)
            .is_err());
        assert!(!reg.is_busy(&ResourceKey::Share(s)));
    }

    #[test]
    fn test_success_removes_and_releases() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        let s = share("fs-1", "a");
        let id = reg
            .register(Intent::new(s.clone(), OperationType::ShareDelete, 0), now)
            .unwrap();

        let observed = reg.observe(id, OperationStatus::Succeeded, None, now).unwrap();
        assert_eq!(observed.operation.status, OperationStatus::Succeeded);
        assert!(reg.get(id).is_none());
        assert!(!reg.is_busy(&ResourceKey::Share(s.clone())));
        reg.register(Intent::new(s, OperationType::ShareCreate, 1), now)
            .unwrap();
    }

    #[test]
    fn test_follow_up_inherits_claims() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        let i = instance("fs-new");
        let s = i.share("a");
        let intent = Intent::new(i.clone(), OperationType::InstanceCreate, 1)
            .then(Intent::new(s.clone(), OperationType::ShareCreate, 1));
        let id = reg.register(intent, now).unwrap();
        assert!(reg.is_busy(&ResourceKey::Share(s.clone())));

        let observed = reg.observe(id, OperationStatus::Succeeded, None, now).unwrap();
        let next = observed.follow_up.unwrap();
        let op = reg.get(next).unwrap();
        assert_eq!(op.op_type, OperationType::ShareCreate);
        assert_eq!(reg.active_for(&ResourceKey::Instance(i)).unwrap().id, next);
        assert_eq!(reg.active_for(&ResourceKey::Share(s)).unwrap().id, next);
    }

    #[test]
    fn test_completing_keeps_claims_until_observed() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        let s = share("fs-1", "a");
        let id = reg
            .register(Intent::new(s.clone(), OperationType::ShareDelete, 0), now)
            .unwrap();
        reg.observe(id, OperationStatus::Unknown, None, now).unwrap();

        let op = reg.mark_completing(id, now).unwrap();
        assert!(op.completing);
        assert_eq!(op.status, OperationStatus::Running);
        assert_eq!(op.unknown_since, None);
        assert!(reg.is_busy(&ResourceKey::Share(s.clone())));
        assert!(reg.is_busy(&ResourceKey::Instance(instance("fs-1"))));
        assert_eq!(reg.counts(), (1, 0));

        reg.observe(id, OperationStatus::Succeeded, None, now).unwrap();
        assert!(!reg.is_busy(&ResourceKey::Share(s)));

        // Terminal operations cannot be reopened
        let failed = reg
            .register(Intent::new(instance("fs-2"), OperationType::InstanceCreate, 1), now)
            .unwrap();
        reg.observe(failed, OperationStatus::Failed, None, now).unwrap();
        assert_matches!(reg.mark_completing(failed, now), Err(Error::Internal(_)));
    }

    #[test]
    fn test_failure_retention_window() {
        let reg = OperationRegistry::new();
        let start = Utc::now();
        let id = reg
            .register(
                Intent::new(instance("fs-1"), OperationType::InstanceCreate, 1),
                start,
            )
            .unwrap();
        reg.observe(id, OperationStatus::Failed, Some("quota".into()), start)
            .unwrap();

        // Failure frees the target for a fresh intent
        assert!(!reg.is_busy(&ResourceKey::Instance(instance("fs-1"))));

        let window = chrono::Duration::minutes(15);
        assert!(reg.evict_expired(start + window).is_empty());
        assert_eq!(reg.get(id).unwrap().status, OperationStatus::Failed);

        let evicted = reg.evict_expired(start + window + chrono::Duration::nanoseconds(1));
        assert_eq!(evicted.len(), 1);
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn test_observe_after_terminal_is_ignored() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        let id = reg
            .register(Intent::new(instance("fs-1"), OperationType::InstanceDelete, 0), now)
            .unwrap();
        reg.observe(id, OperationStatus::Failed, None, now).unwrap();
        let observed = reg.observe(id, OperationStatus::Succeeded, None, now).unwrap();
        assert_eq!(observed.operation.status, OperationStatus::Failed);
    }

    #[test]
    fn test_unknown_status_keeps_claims() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        let key = ResourceKey::Instance(instance("fs-1"));
        let id = reg
            .register(Intent::new(instance("fs-1"), OperationType::InstanceUpdate, 2), now)
            .unwrap();
        let observed = reg.observe(id, OperationStatus::Unknown, None, now).unwrap();
        assert_eq!(observed.operation.unknown_since, Some(now));
        assert!(reg.is_busy(&key));
        assert_eq!(reg.list_active().count(), 1);
    }

    #[test]
    fn test_list_active_is_lazy_and_restartable() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        let a = reg
            .register(Intent::new(instance("a"), OperationType::InstanceCreate, 1), now)
            .unwrap();
        reg.register(Intent::new(instance("b"), OperationType::InstanceCreate, 1), now)
            .unwrap();

        let mut iter = reg.list_active();
        assert_eq!(iter.next().unwrap().id, a);
        // Completes after the snapshot; skipped on the next pass
        reg.observe(a, OperationStatus::Succeeded, None, now).unwrap();
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());

        iter.rewind();
        assert_eq!(iter.count(), 1);
    }

    #[test]
    fn test_record_restore() {
        let reg = OperationRegistry::new();
        let now = Utc::now();
        let s = share("fs-1", "a");
        let id = reg
            .register(Intent::new(s.clone(), OperationType::ShareUpdate, 300), now)
            .unwrap();
        reg.mark_started(id, "operations/op-1".into(), now);
        let record = reg.get(id).unwrap().to_record();

        let fresh = OperationRegistry::new();
        let restored = fresh.restore(ResourceKey::Share(s.clone()), &record).unwrap();
        let op = fresh.get(restored).unwrap();
        assert_eq!(op.op_type, OperationType::ShareUpdate);
        assert_eq!(op.backend_name.as_deref(), Some("operations/op-1"));
        assert_eq!(op.start_time, now);
        assert!(fresh.is_busy(&ResourceKey::Instance(instance("fs-1"))));
    }

    #[test]
    fn test_concurrent_registration_admits_one() {
        let reg = Arc::new(OperationRegistry::new());
        let s = share("fs-1", "pvc-1");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = reg.clone();
                let s = s.clone();
                std::thread::spawn(move || {
                    reg.register(Intent::new(s, OperationType::ShareDelete, 0), Utc::now())
                        .is_ok()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(reg.counts(), (1, 0));
    }
}
