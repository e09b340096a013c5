//! Capacity Model
//!
//! In-memory view of every known instance's total capacity, consumed
//! capacity and attached shares. Sharded by instance handle so mutations of
//! different instances never contend. The model is a cache over external
//! truth: it only changes on confirmed operation completions and can be
//! rebuilt from the resource store.

use super::constraints::Constraints;
use super::events::ModelEvent;
use super::identity::{InstanceHandle, ResourceKey, ShareHandle, VolumeId};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Constants
// =============================================================================

/// Number of instance shards
pub const MODEL_SHARD_COUNT: usize = 64;

fn shard_index(handle: &InstanceHandle) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    handle.hash(&mut hasher);
    (hasher.finish() as usize) % MODEL_SHARD_COUNT
}

// =============================================================================
// Lifecycle State
// =============================================================================

/// Lifecycle of an instance or share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum LifecycleState {
    /// Create intent issued
    #[default]
    Pending,
    /// Create confirmed
    Ready,
    /// Resize in flight
    Updating,
    /// Delete intent issued, finalizer still present
    Deleting,
    /// Delete confirmed
    Deleted,
    /// Terminal for automatic retry
    Error,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Pending => write!(f, "pending"),
            LifecycleState::Ready => write!(f, "ready"),
            LifecycleState::Updating => write!(f, "updating"),
            LifecycleState::Deleting => write!(f, "deleting"),
            LifecycleState::Deleted => write!(f, "deleted"),
            LifecycleState::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Entries
// =============================================================================

/// A backing instance as seen by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEntry {
    pub handle: InstanceHandle,
    pub storage_class_key: String,
    pub total_capacity: u64,
    /// Share cap for the class profile this instance was created under
    pub max_shares: u32,
    /// Attached share name -> debited capacity
    pub shares: BTreeMap<String, u64>,
    pub state: LifecycleState,
    pub finalizer: bool,
    pub created_at: DateTime<Utc>,
}

impl InstanceEntry {
    pub fn new(
        handle: InstanceHandle,
        storage_class_key: impl Into<String>,
        total_capacity: u64,
        max_shares: u32,
    ) -> Self {
        Self {
            handle,
            storage_class_key: storage_class_key.into(),
            total_capacity,
            max_shares,
            shares: BTreeMap::new(),
            state: LifecycleState::Pending,
            finalizer: false,
            created_at: Utc::now(),
        }
    }

    pub fn consumed_capacity(&self) -> u64 {
        self.shares.values().sum()
    }

    pub fn share_count(&self) -> u32 {
        self.shares.len() as u32
    }

    pub fn headroom(&self) -> u64 {
        self.total_capacity.saturating_sub(self.consumed_capacity())
    }

    pub fn free_slots(&self) -> u32 {
        self.max_shares.saturating_sub(self.share_count())
    }

    /// Whether a share of `bytes` can be placed here without growing
    pub fn can_fit(&self, bytes: u64) -> bool {
        self.state == LifecycleState::Ready && self.headroom() >= bytes && self.free_slots() > 0
    }

    /// Bytes this instance must grow by to fit `bytes`, rounded to the step
    ///
    /// `None` when the instance is not Ready, has no free slot, or would
    /// exceed the instance ceiling.
    pub fn growth_needed(&self, bytes: u64, constraints: &Constraints) -> Option<u64> {
        if self.state != LifecycleState::Ready || self.free_slots() == 0 {
            return None;
        }
        if self.headroom() >= bytes {
            return Some(0);
        }
        let target = constraints.round_up_to_step(self.consumed_capacity() + bytes);
        (target <= constraints.max_instance_size).then(|| target - self.total_capacity)
    }

    /// Fraction of capacity in use, for ordering
    pub fn fill_ratio(&self) -> f64 {
        if self.total_capacity == 0 {
            return 1.0;
        }
        self.consumed_capacity() as f64 / self.total_capacity as f64
    }
}

/// A share as seen by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareEntry {
    pub handle: ShareHandle,
    pub storage_class_key: String,
    pub capacity: u64,
    pub state: LifecycleState,
    pub finalizer: bool,
}

impl ShareEntry {
    pub fn new(handle: ShareHandle, storage_class_key: impl Into<String>, capacity: u64) -> Self {
        Self {
            handle,
            storage_class_key: storage_class_key.into(),
            capacity,
            state: LifecycleState::Pending,
            finalizer: false,
        }
    }

    /// Owning instance lookup key
    pub fn instance(&self) -> &InstanceHandle {
        &self.handle.instance
    }

    /// Orchestrator-facing identifier
    pub fn volume_id(&self) -> VolumeId {
        VolumeId::new(self.storage_class_key.clone(), self.handle.clone())
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of model-wide totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStats {
    pub instances: u64,
    pub ready_instances: u64,
    pub shares: u64,
    pub total_capacity_bytes: u64,
    pub consumed_capacity_bytes: u64,
}

// =============================================================================
// Capacity Model
// =============================================================================

/// Sharded capacity model
pub struct CapacityModel {
    shards: Vec<RwLock<HashMap<InstanceHandle, InstanceEntry>>>,
    shares: DashMap<ShareHandle, ShareEntry>,
    constraints: Constraints,
    event_sender: broadcast::Sender<ModelEvent>,
}

impl CapacityModel {
    /// Create an empty model bounded by `constraints`
    pub fn new(constraints: Constraints) -> Arc<Self> {
        let shards = (0..MODEL_SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        let (event_sender, _) = broadcast::channel(1024);

        Arc::new(Self {
            shards,
            shares: DashMap::new(),
            constraints,
            event_sender,
        })
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: ModelEvent) {
        let _ = self.event_sender.send(event);
    }

    fn shard(&self, handle: &InstanceHandle) -> &RwLock<HashMap<InstanceHandle, InstanceEntry>> {
        &self.shards[shard_index(handle)]
    }

    /// Apply `f` to an instance under its shard's write lock
    fn with_instance<T>(
        &self,
        handle: &InstanceHandle,
        f: impl FnOnce(&mut InstanceEntry) -> Result<T>,
    ) -> Result<T> {
        let mut shard = self.shard(handle).write();
        let entry = shard.get_mut(handle).ok_or_else(|| Error::ResourceNotFound {
            kind: "Instance".into(),
            name: handle.to_string(),
        })?;
        f(entry)
    }

    fn check_instance_size(&self, handle: &InstanceHandle, total: u64) -> Result<()> {
        if total < self.constraints.min_instance_size || total > self.constraints.max_instance_size {
            return Err(Error::Internal(format!(
                "instance {} capacity {} outside [{}, {}]",
                handle, total, self.constraints.min_instance_size, self.constraints.max_instance_size
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Instances
    // -------------------------------------------------------------------------

    /// Track a new instance
    pub fn insert_instance(&self, entry: InstanceEntry) -> Result<()> {
        self.check_instance_size(&entry.handle, entry.total_capacity)?;
        if entry.consumed_capacity() > entry.total_capacity || entry.share_count() > entry.max_shares {
            return Err(Error::Internal(format!(
                "instance {} violates capacity invariants",
                entry.handle
            )));
        }

        let mut shard = self.shard(&entry.handle).write();
        if shard.contains_key(&entry.handle) {
            return Err(Error::Internal(format!(
                "instance {} already tracked",
                entry.handle
            )));
        }
        let event = ModelEvent::InstanceAdded {
            instance: entry.handle.to_string(),
            capacity_bytes: entry.total_capacity,
        };
        shard.insert(entry.handle.clone(), entry);
        drop(shard);

        self.emit(event);
        Ok(())
    }

    pub fn instance(&self, handle: &InstanceHandle) -> Option<InstanceEntry> {
        self.shard(handle).read().get(handle).cloned()
    }

    pub fn contains_instance(&self, handle: &InstanceHandle) -> bool {
        self.shard(handle).read().contains_key(handle)
    }

    /// `totalCapacity - consumedCapacity`
    pub fn headroom(&self, handle: &InstanceHandle) -> Option<u64> {
        self.shard(handle).read().get(handle).map(InstanceEntry::headroom)
    }

    pub fn can_fit(&self, handle: &InstanceHandle, bytes: u64) -> bool {
        self.shard(handle)
            .read()
            .get(handle)
            .is_some_and(|e| e.can_fit(bytes))
    }

    pub fn growth_needed(&self, handle: &InstanceHandle, bytes: u64) -> Option<u64> {
        self.shard(handle)
            .read()
            .get(handle)
            .and_then(|e| e.growth_needed(bytes, &self.constraints))
    }

    /// Snapshot of every instance serving a storage class
    pub fn candidates(&self, storage_class_key: &str) -> Vec<InstanceEntry> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .values()
                    .filter(|e| e.storage_class_key == storage_class_key)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn instances(&self) -> Vec<InstanceEntry> {
        let mut all: Vec<InstanceEntry> = self
            .shards
            .iter()
            .flat_map(|shard| shard.read().values().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| a.handle.cmp(&b.handle));
        all
    }

    pub fn set_instance_state(&self, handle: &InstanceHandle, state: LifecycleState) -> Result<LifecycleState> {
        let from = self.with_instance(handle, |e| Ok(std::mem::replace(&mut e.state, state)))?;
        if from != state {
            self.emit(ModelEvent::InstanceStateChanged {
                instance: handle.to_string(),
                from,
                to: state,
            });
        }
        Ok(from)
    }

    /// Change an instance's total capacity after a confirmed resize
    pub fn resize_instance(&self, handle: &InstanceHandle, total: u64) -> Result<()> {
        self.check_instance_size(handle, total)?;
        self.with_instance(handle, |e| {
            if total < e.consumed_capacity() {
                return Err(Error::Internal(format!(
                    "instance {} cannot shrink below consumed {}",
                    handle,
                    e.consumed_capacity()
                )));
            }
            e.total_capacity = total;
            Ok(())
        })?;
        self.emit(ModelEvent::InstanceResized {
            instance: handle.to_string(),
            capacity_bytes: total,
        });
        Ok(())
    }

    /// Drop an instance; refuses while shares are still attached
    pub fn remove_instance(&self, handle: &InstanceHandle) -> Result<InstanceEntry> {
        let mut shard = self.shard(handle).write();
        match shard.get(handle) {
            None => {
                return Err(Error::ResourceNotFound {
                    kind: "Instance".into(),
                    name: handle.to_string(),
                })
            }
            Some(e) if !e.shares.is_empty() => {
                return Err(Error::Internal(format!(
                    "instance {} still hosts {} shares",
                    handle,
                    e.shares.len()
                )))
            }
            Some(_) => {}
        }
        let removed = shard.remove(handle).ok_or_else(|| Error::ResourceNotFound {
            kind: "Instance".into(),
            name: handle.to_string(),
        })?;
        drop(shard);

        self.emit(ModelEvent::InstanceRemoved {
            instance: handle.to_string(),
        });
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Shares
    // -------------------------------------------------------------------------

    /// Track a share; it consumes nothing until attached
    pub fn insert_share(&self, entry: ShareEntry) -> Result<()> {
        if !self.contains_instance(entry.instance()) {
            return Err(Error::ResourceNotFound {
                kind: "Instance".into(),
                name: entry.instance().to_string(),
            });
        }
        match self.shares.entry(entry.handle.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Internal(format!(
                "share {} already tracked",
                entry.handle
            ))),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(entry);
                Ok(())
            }
        }
    }

    pub fn share(&self, handle: &ShareHandle) -> Option<ShareEntry> {
        self.shares.get(handle).map(|s| s.clone())
    }

    pub fn shares(&self) -> Vec<ShareEntry> {
        let mut all: Vec<ShareEntry> = self.shares.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.handle.cmp(&b.handle));
        all
    }

    /// Shares in `state` placed on `instance`
    pub fn shares_on(&self, instance: &InstanceHandle, state: LifecycleState) -> Vec<ShareEntry> {
        let mut found: Vec<ShareEntry> = self
            .shares
            .iter()
            .filter(|s| s.instance() == instance && s.state == state)
            .map(|s| s.clone())
            .collect();
        found.sort_by(|a, b| a.handle.cmp(&b.handle));
        found
    }

    pub fn set_share_state(&self, handle: &ShareHandle, state: LifecycleState) -> Result<LifecycleState> {
        let from = {
            let mut share = self.shares.get_mut(handle).ok_or_else(|| Error::ResourceNotFound {
                kind: "Share".into(),
                name: handle.to_string(),
            })?;
            std::mem::replace(&mut share.state, state)
        };
        if from != state {
            self.emit(ModelEvent::ShareStateChanged {
                instance: handle.instance.to_string(),
                share: handle.name.clone(),
                from,
                to: state,
            });
        }
        Ok(from)
    }

    /// Debit a share's capacity from its instance after a confirmed create
    ///
    /// Re-attaching an already attached share with the same size is a no-op.
    pub fn attach_share(&self, share: &ShareHandle, bytes: u64) -> Result<()> {
        self.with_instance(&share.instance, |e| {
            if e.shares.get(&share.name) == Some(&bytes) {
                return Ok(());
            }
            if e.shares.contains_key(&share.name) {
                return Err(Error::Internal(format!("share {} attached twice", share)));
            }
            if e.free_slots() == 0 || e.headroom() < bytes {
                return Err(Error::Internal(format!(
                    "attaching {} ({} bytes) would overfill {}",
                    share.name, bytes, share.instance
                )));
            }
            e.shares.insert(share.name.clone(), bytes);
            Ok(())
        })?;
        if let Some(mut s) = self.shares.get_mut(share) {
            s.capacity = bytes;
        }
        self.emit(ModelEvent::ShareAttached {
            instance: share.instance.to_string(),
            share: share.name.clone(),
            capacity_bytes: bytes,
        });
        Ok(())
    }

    /// Credit a share's capacity back after a confirmed delete
    pub fn detach_share(&self, share: &ShareHandle) -> Result<u64> {
        let freed = self.with_instance(&share.instance, |e| Ok(e.shares.remove(&share.name).unwrap_or(0)))?;
        self.emit(ModelEvent::ShareDetached {
            instance: share.instance.to_string(),
            share: share.name.clone(),
        });
        Ok(freed)
    }

    /// Change a share's debit after a confirmed resize
    pub fn resize_share(&self, share: &ShareHandle, bytes: u64) -> Result<()> {
        self.with_instance(&share.instance, |e| {
            let current = *e.shares.get(&share.name).ok_or_else(|| Error::ResourceNotFound {
                kind: "Share".into(),
                name: share.to_string(),
            })?;
            if e.consumed_capacity() - current + bytes > e.total_capacity {
                return Err(Error::Internal(format!(
                    "resizing {} to {} would overfill {}",
                    share.name, bytes, share.instance
                )));
            }
            e.shares.insert(share.name.clone(), bytes);
            Ok(())
        })?;
        if let Some(mut s) = self.shares.get_mut(share) {
            s.capacity = bytes;
        }
        self.emit(ModelEvent::ShareResized {
            instance: share.instance.to_string(),
            share: share.name.clone(),
            capacity_bytes: bytes,
        });
        Ok(())
    }

    pub fn remove_share(&self, handle: &ShareHandle) -> Option<ShareEntry> {
        self.shares.remove(handle).map(|(_, s)| s)
    }

    // -------------------------------------------------------------------------
    // Finalizer mirror
    // -------------------------------------------------------------------------

    /// Mirror a resource's protective marker
    pub fn set_finalizer(&self, key: &ResourceKey, present: bool) {
        match key {
            ResourceKey::Instance(h) => {
                let _ = self.with_instance(h, |e| {
                    e.finalizer = present;
                    Ok(())
                });
            }
            ResourceKey::Share(h) => {
                if let Some(mut s) = self.shares.get_mut(h) {
                    s.finalizer = present;
                }
            }
        }
    }

    /// Get model-wide totals
    pub fn stats(&self) -> ModelStats {
        let mut stats = ModelStats {
            shares: self.shares.len() as u64,
            ..ModelStats::default()
        };
        for shard in &self.shards {
            for e in shard.read().values() {
                stats.instances += 1;
                if e.state == LifecycleState::Ready {
                    stats.ready_instances += 1;
                }
                stats.total_capacity_bytes += e.total_capacity;
                stats.consumed_capacity_bytes += e.consumed_capacity();
            }
        }
        stats
    }
}
