//! Finalizer Guard
//!
//! A resource carrying the protective marker is never physically removed.
//! The marker is set at creation and cleared only with a `DeletionConfirmed`
//! token, which exists solely for delete operations observed to succeed.

use super::capacity::CapacityModel;
use super::identity::ResourceKey;
use super::operations::{Operation, OperationStatus};
use crate::domain::ports::ResourceStore;
use crate::error::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Proof that a delete operation on a resource reached `Succeeded`
#[derive(Debug)]
pub struct DeletionConfirmed {
    key: ResourceKey,
}

impl DeletionConfirmed {
    /// Only the reconciler mints these, from a delete the backend completed
    pub(crate) fn from_operation(op: &Operation) -> Option<Self> {
        let done = op.completing || op.status == OperationStatus::Succeeded;
        (done && op.op_type.is_delete()).then(|| Self {
            key: op.target.clone(),
        })
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
}

/// Guards the protective marker on instances and shares
pub struct FinalizerGuard {
    store: Arc<dyn ResourceStore>,
    model: Arc<CapacityModel>,
}

impl FinalizerGuard {
    pub fn new(store: Arc<dyn ResourceStore>, model: Arc<CapacityModel>) -> Self {
        Self { store, model }
    }

    /// Set the marker on a freshly created resource
    pub async fn protect(&self, key: &ResourceKey) -> Result<()> {
        self.store.set_finalizer(key, true).await?;
        self.model.set_finalizer(key, true);
        debug!("Protected {}", key);
        Ok(())
    }

    /// Clear the marker after a confirmed delete
    pub async fn release(&self, confirmed: &DeletionConfirmed) -> Result<()> {
        self.store.set_finalizer(&confirmed.key, false).await?;
        self.model.set_finalizer(&confirmed.key, false);
        info!("Released finalizer on {}", confirmed.key);
        Ok(())
    }

    /// Whether the resource may be physically removed
    pub async fn can_delete(&self, key: &ResourceKey) -> Result<bool> {
        Ok(!self.store.has_finalizer(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::MemoryStore;
    use crate::domain::ports::ShareRecord;
    use crate::multishare::capacity::LifecycleState;
    use crate::multishare::constraints::{Constraints, GIB};
    use crate::multishare::identity::InstanceHandle;
    use crate::multishare::operations::{Intent, OperationRegistry, OperationType};
    use chrono::Utc;

    #[test]
    fn test_token_requires_succeeded_delete() {
        let registry = OperationRegistry::new();
        let share = InstanceHandle::new("p", "l", "fs-1").share("a");
        let id = registry
            .register(Intent::new(share.clone(), OperationType::ShareDelete, GIB), Utc::now())
            .unwrap();

        let running = registry.get(id).unwrap();
        assert!(DeletionConfirmed::from_operation(&running).is_none());

        let completing = registry.mark_completing(id, Utc::now()).unwrap();
        assert!(DeletionConfirmed::from_operation(&completing).is_some());

        let done = registry
            .observe(id, OperationStatus::Succeeded, None, Utc::now())
            .unwrap();
        assert!(DeletionConfirmed::from_operation(&done.operation).is_some());

        let id = registry
            .register(Intent::new(share, OperationType::ShareCreate, GIB), Utc::now())
            .unwrap();
        let done = registry
            .observe(id, OperationStatus::Succeeded, None, Utc::now())
            .unwrap();
        assert!(DeletionConfirmed::from_operation(&done.operation).is_none());
    }

    #[tokio::test]
    async fn test_protect_blocks_removal_until_release() {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let guard = FinalizerGuard::new(store.clone(), CapacityModel::new(Constraints::default()));
        let share = InstanceHandle::new("p", "l", "fs-1").share("a");
        let key = ResourceKey::from(share.clone());

        store
            .save_share(&ShareRecord {
                handle: share.clone(),
                storage_class_key: "default".into(),
                capacity_bytes: 100 * GIB,
                state: LifecycleState::Deleting,
                operation: None,
                error: None,
            })
            .await
            .unwrap();
        guard.protect(&key).await.unwrap();
        assert!(!guard.can_delete(&key).await.unwrap());
        assert!(store.remove_share(&share).await.is_err());

        guard
            .release(&DeletionConfirmed { key: key.clone() })
            .await
            .unwrap();
        assert!(guard.can_delete(&key).await.unwrap());
        store.remove_share(&share).await.unwrap();
    }
}
