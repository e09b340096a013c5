//! Multishare core
//!
//! Capacity-aware packing of shares onto shared instances plus the
//! asynchronous operation lifecycle that tracks every create, update and
//! delete to completion.
//!
//! Dependency order, leaves first:
//! - `constraints`: capacity and packing limits
//! - `capacity`: sharded view of instance capacity and attached shares
//! - `packing`: placement of a share request
//! - `operations`: operation types and the exclusion registry
//! - `reconciler`: drives operations against the backend
//! - `finalizer`: protective marker on instances and shares

pub mod capacity;
pub mod constraints;
pub mod events;
pub mod finalizer;
pub mod identity;
pub mod operations;
pub mod packing;
pub mod persist;
pub mod reconciler;
pub mod timefmt;

pub use capacity::{CapacityModel, InstanceEntry, LifecycleState, ModelStats, ShareEntry};
pub use constraints::Constraints;
pub use events::ModelEvent;
pub use finalizer::{DeletionConfirmed, FinalizerGuard};
pub use identity::{InstanceHandle, ResourceKey, ShareHandle, VolumeId};
pub use operations::{
    Intent, Operation, OperationId, OperationRecord, OperationRegistry, OperationStatus,
    OperationType, ResourceKind,
};
pub use packing::{PackingAllocator, PackingPolicy, PlacementDecision, PlacementOrder, ShareRequest};
pub use persist::StateWriter;
pub use reconciler::{OperationReconciler, ReconcileReport, ReconcilerConfig};
