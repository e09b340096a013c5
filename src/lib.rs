//! Multishare Controller
//!
//! Packs many small file shares onto a smaller number of large managed file
//! storage instances and drives every create, resize and delete through the
//! service's long-running operations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         Multishare Controller                                │
//! │        create_share / delete_share / expand_share / rebuild                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    Packing      │  │   Operation     │  │      Finalizer              │  │
//! │  │    Allocator    │  │   Registry      │  │      Guard                  │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │  ┌────────┴────────┐  ┌────────┴────────────────────────┴───────────────┐   │
//! │  │ Capacity Model  │◄─┤            Operation Reconciler                  │   │
//! │  │ (64-way sharded)│  │   (per-operation exponential backoff polling)    │   │
//! │  └─────────────────┘  └──────────────────────┬──────────────────────────┘   │
//! ├──────────────────────────────────────────────┼──────────────────────────────┤
//! │  ┌─────────────────────────────┐  ┌──────────┴──────────────────────────┐   │
//! │  │      Resource Store         │  │        Operation Backend            │   │
//! │  │  (InstanceInfo/ShareInfo)   │  │   (managed file service LROs)       │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`multishare`]: capacity model, packing, operations, reconciler
//! - [`controlplane`]: controller entry points, REST API, adapters, metrics
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: trait seams to external collaborators
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod multishare;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, ControllerConfig, ControllerMetrics, ControllerStatus,
    DeleteOutcome, ExpandOutcome, InMemoryFilestore, KubeStore, MemoryStore,
    MultishareController, RebuildReport, ShareProvisioned, StoreFactory,
};

pub use crd::{InstanceInfo, InstanceInfoSpec, InstanceInfoStatus, ShareInfo, ShareInfoSpec, ShareInfoStatus};

pub use domain::ports::{BackendPoll, InstanceRecord, OperationBackend, ResourceStore, ShareRecord};

pub use error::{Error, ErrorAction, Result, RetryClass};

pub use multishare::{
    CapacityModel, Constraints, InstanceHandle, LifecycleState, OperationRegistry,
    OperationReconciler, OperationStatus, OperationType, PackingAllocator, PackingPolicy,
    PlacementDecision, PlacementOrder, ReconcilerConfig, ResourceKey, ShareHandle, ShareRequest,
    VolumeId,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
