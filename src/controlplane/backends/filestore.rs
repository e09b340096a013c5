//! In-memory Filestore backend
//!
//! Simulates the managed file service's long-running operations: every
//! operation completes after a fixed number of polls and is applied to an
//! in-memory view of instances and shares. Failures, stalls and outages can
//! be injected per target.

use crate::domain::ports::{BackendPoll, OperationBackend};
use crate::error::{Error, Result};
use crate::multishare::identity::{InstanceHandle, ResourceKey, ShareHandle};
use crate::multishare::operations::{Intent, OperationType};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// State of a simulated long-running operation
#[derive(Debug, Clone)]
struct BackendOperation {
    target: ResourceKey,
    op_type: OperationType,
    capacity_bytes: u64,
    polls: u32,
    outcome: Option<BackendPoll>,
}

/// Filestore simulation for standalone mode and tests
pub struct InMemoryFilestore {
    polls_to_complete: u32,
    operations: RwLock<BTreeMap<String, BackendOperation>>,
    instances: RwLock<BTreeMap<InstanceHandle, u64>>,
    shares: RwLock<BTreeMap<ShareHandle, u64>>,
    failures: RwLock<BTreeMap<ResourceKey, String>>,
    stalled: RwLock<BTreeSet<ResourceKey>>,
    available: AtomicBool,
    counter: AtomicU64,
}

impl InMemoryFilestore {
    /// Create a backend whose operations finish on the `polls_to_complete`th poll
    pub fn new(polls_to_complete: u32) -> Self {
        Self {
            polls_to_complete: polls_to_complete.max(1),
            operations: RwLock::new(BTreeMap::new()),
            instances: RwLock::new(BTreeMap::new()),
            shares: RwLock::new(BTreeMap::new()),
            failures: RwLock::new(BTreeMap::new()),
            stalled: RwLock::new(BTreeSet::new()),
            available: AtomicBool::new(true),
            counter: AtomicU64::new(0),
        }
    }

    /// Make every operation on `target` fail with `reason`
    pub fn fail_target(&self, target: ResourceKey, reason: impl Into<String>) {
        self.failures.write().insert(target, reason.into());
    }

    /// Keep every operation on `target` running forever
    pub fn stall_target(&self, target: ResourceKey) {
        self.stalled.write().insert(target);
    }

    pub fn clear_faults(&self) {
        self.failures.write().clear();
        self.stalled.write().clear();
    }

    /// Toggle a full service outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of distinct operations issued
    pub fn started(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn instance_capacity(&self, handle: &InstanceHandle) -> Option<u64> {
        self.instances.read().get(handle).copied()
    }

    pub fn share_capacity(&self, handle: &ShareHandle) -> Option<u64> {
        self.shares.read().get(handle).copied()
    }

    fn check_available(&self, call: &str) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::backend(call, "service unavailable"))
        }
    }

    /// Apply a completed operation to the simulated service state
    fn complete(&self, op: &BackendOperation) -> BackendPoll {
        if let Some(reason) = self.failures.read().get(&op.target) {
            return BackendPoll::failed(reason.clone());
        }

        match (&op.target, op.op_type) {
            (ResourceKey::Instance(h), OperationType::InstanceCreate | OperationType::InstanceUpdate) => {
                self.instances.write().insert(h.clone(), op.capacity_bytes);
            }
            (ResourceKey::Instance(h), OperationType::InstanceDelete) => {
                if self.shares.read().keys().any(|s| &s.instance == h) {
                    return BackendPoll::failed(format!("instance {} still has shares", h));
                }
                self.instances.write().remove(h);
            }
            (ResourceKey::Share(s), OperationType::ShareCreate | OperationType::ShareUpdate) => {
                if !self.instances.read().contains_key(&s.instance) {
                    return BackendPoll::failed(format!("instance {} not found", s.instance));
                }
                self.shares.write().insert(s.clone(), op.capacity_bytes);
            }
            (ResourceKey::Share(s), OperationType::ShareDelete) => {
                self.shares.write().remove(s);
            }
            (target, op_type) => {
                return BackendPoll::failed(format!("{} is not valid for {}", op_type, target));
            }
        }
        BackendPoll::succeeded()
    }
}

impl Default for InMemoryFilestore {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl OperationBackend for InMemoryFilestore {
    async fn start(&self, intent: &Intent) -> Result<String> {
        self.check_available("start")?;

        let mut operations = self.operations.write();
        if let Some((name, _)) = operations.iter().find(|(_, op)| {
            op.target == intent.target && op.op_type == intent.op_type && op.outcome.is_none()
        }) {
            return Ok(name.clone());
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let instance = intent.target.instance();
        let name = format!(
            "projects/{}/locations/{}/operations/operation-{:016x}",
            instance.project, instance.location, n
        );
        operations.insert(
            name.clone(),
            BackendOperation {
                target: intent.target.clone(),
                op_type: intent.op_type,
                capacity_bytes: intent.capacity_bytes,
                polls: 0,
                outcome: None,
            },
        );
        debug!("Issued {} {} as {}", intent.op_type, intent.target, name);
        Ok(name)
    }

    async fn poll(&self, operation_name: &str) -> Result<BackendPoll> {
        self.check_available("poll")?;

        let snapshot = {
            let mut operations = self.operations.write();
            let op = operations
                .get_mut(operation_name)
                .ok_or_else(|| Error::backend("poll", format!("{} not found", operation_name)))?;
            if let Some(outcome) = &op.outcome {
                return Ok(outcome.clone());
            }
            op.polls += 1;
            op.clone()
        };

        if self.stalled.read().contains(&snapshot.target) || snapshot.polls < self.polls_to_complete {
            return Ok(BackendPoll::running());
        }

        let outcome = self.complete(&snapshot);
        if let Some(op) = self.operations.write().get_mut(operation_name) {
            op.outcome = Some(outcome.clone());
        }
        Ok(outcome)
    }
}
