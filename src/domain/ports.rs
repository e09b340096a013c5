//! Domain Ports - trait seams to the controller's external collaborators
//!
//! The core never talks to the cloud service or the persistence layer
//! directly. Adapters implement these traits to provide concrete
//! functionality.

use crate::error::Result;
use crate::multishare::capacity::LifecycleState;
use crate::multishare::identity::{InstanceHandle, ResourceKey, ShareHandle};
use crate::multishare::operations::{Intent, OperationRecord, OperationStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Persisted Records
// =============================================================================

/// Durable form of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub handle: InstanceHandle,
    pub storage_class_key: String,
    pub capacity_bytes: u64,
    /// Share cap of the packing profile the instance was created under
    pub max_shares: u32,
    /// Shares placed on the instance
    pub share_names: Vec<String>,
    pub state: LifecycleState,
    /// Operation in flight or retained after failure
    pub operation: Option<OperationRecord>,
    pub error: Option<String>,
}

/// Durable form of a share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRecord {
    pub handle: ShareHandle,
    pub storage_class_key: String,
    pub capacity_bytes: u64,
    pub state: LifecycleState,
    pub operation: Option<OperationRecord>,
    pub error: Option<String>,
}

impl ShareRecord {
    pub fn instance(&self) -> &InstanceHandle {
        &self.handle.instance
    }
}

// =============================================================================
// Operation Backend
// =============================================================================

/// Result of polling a backend long-running operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPoll {
    pub status: OperationStatus,
    /// Failure detail reported by the backend
    pub error: Option<String>,
}

impl BackendPoll {
    pub fn running() -> Self {
        Self {
            status: OperationStatus::Running,
            error: None,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            status: OperationStatus::Succeeded,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Failed,
            error: Some(reason.into()),
        }
    }
}

/// Trait for the managed file-storage service's long-running operations
#[async_trait]
pub trait OperationBackend: Send + Sync {
    /// Issue the call for an intent, returning the backend operation name
    ///
    /// Issuing the same intent twice must not create the resource twice.
    async fn start(&self, intent: &Intent) -> Result<String>;

    /// Fetch the current status of a backend operation
    async fn poll(&self, operation_name: &str) -> Result<BackendPoll>;
}

// =============================================================================
// Resource Store
// =============================================================================

/// Trait for durable instance/share objects and their protective marker
///
/// Removal of a resource whose finalizer is set must fail with
/// `Error::FinalizerPresent`.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn save_instance(&self, record: &InstanceRecord) -> Result<()>;

    async fn save_share(&self, record: &ShareRecord) -> Result<()>;

    async fn load_instances(&self) -> Result<Vec<InstanceRecord>>;

    async fn load_shares(&self) -> Result<Vec<ShareRecord>>;

    async fn remove_instance(&self, handle: &InstanceHandle) -> Result<()>;

    async fn remove_share(&self, handle: &ShareHandle) -> Result<()>;

    async fn set_finalizer(&self, key: &ResourceKey, present: bool) -> Result<()>;

    async fn has_finalizer(&self, key: &ResourceKey) -> Result<bool>;

    /// Attach an operation record to the resource it targets
    async fn save_operation(&self, target: &ResourceKey, record: &OperationRecord) -> Result<()>;

    async fn remove_operation(&self, target: &ResourceKey) -> Result<()>;

    /// Every persisted operation record with its target
    async fn load_operations(&self) -> Result<Vec<(ResourceKey, OperationRecord)>>;
}
