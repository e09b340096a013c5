//! In-memory resource store

use crate::domain::ports::{InstanceRecord, ResourceStore, ShareRecord};
use crate::error::{Error, Result};
use crate::multishare::identity::{InstanceHandle, ResourceKey, ShareHandle};
use crate::multishare::operations::OperationRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

/// Resource store kept in process memory
#[derive(Default)]
pub struct MemoryStore {
    instances: RwLock<BTreeMap<InstanceHandle, InstanceRecord>>,
    shares: RwLock<BTreeMap<ShareHandle, ShareRecord>>,
    finalizers: RwLock<BTreeSet<ResourceKey>>,
    /// Keys whose next write fails
    faults: Mutex<BTreeSet<ResourceKey>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next write that touches `key`
    pub fn fail_next_write(&self, key: ResourceKey) {
        self.faults.lock().insert(key);
    }

    fn check_fault(&self, key: &ResourceKey) -> Result<()> {
        if self.faults.lock().remove(key) {
            return Err(Error::backend("store write", format!("{} is unavailable", key)));
        }
        Ok(())
    }

    async fn exists(&self, key: &ResourceKey) -> bool {
        match key {
            ResourceKey::Instance(h) => self.instances.read().await.contains_key(h),
            ResourceKey::Share(h) => self.shares.read().await.contains_key(h),
        }
    }

    async fn set_operation(&self, target: &ResourceKey, record: Option<OperationRecord>) -> Result<()> {
        self.check_fault(target)?;
        let missing = || Error::ResourceNotFound {
            kind: target.kind().as_str().into(),
            name: target.to_string(),
        };
        match target {
            ResourceKey::Instance(h) => {
                self.instances.write().await.get_mut(h).ok_or_else(missing)?.operation = record;
            }
            ResourceKey::Share(h) => {
                self.shares.write().await.get_mut(h).ok_or_else(missing)?.operation = record;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn save_instance(&self, record: &InstanceRecord) -> Result<()> {
        self.check_fault(&ResourceKey::Instance(record.handle.clone()))?;
        self.instances
            .write()
            .await
            .insert(record.handle.clone(), record.clone());
        Ok(())
    }

    async fn save_share(&self, record: &ShareRecord) -> Result<()> {
        self.check_fault(&ResourceKey::Share(record.handle.clone()))?;
        self.shares
            .write()
            .await
            .insert(record.handle.clone(), record.clone());
        Ok(())
    }

    async fn load_instances(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self.instances.read().await.values().cloned().collect())
    }

    async fn load_shares(&self) -> Result<Vec<ShareRecord>> {
        Ok(self.shares.read().await.values().cloned().collect())
    }

    async fn remove_instance(&self, handle: &InstanceHandle) -> Result<()> {
        let key = ResourceKey::Instance(handle.clone());
        self.check_fault(&key)?;
        if self.finalizers.read().await.contains(&key) {
            return Err(Error::FinalizerPresent {
                resource: key.to_string(),
            });
        }
        self.instances.write().await.remove(handle);
        Ok(())
    }

    async fn remove_share(&self, handle: &ShareHandle) -> Result<()> {
        let key = ResourceKey::Share(handle.clone());
        self.check_fault(&key)?;
        if self.finalizers.read().await.contains(&key) {
            return Err(Error::FinalizerPresent {
                resource: key.to_string(),
            });
        }
        self.shares.write().await.remove(handle);
        Ok(())
    }

    async fn set_finalizer(&self, key: &ResourceKey, present: bool) -> Result<()> {
        self.check_fault(key)?;
        if !present {
            self.finalizers.write().await.remove(key);
            return Ok(());
        }
        if !self.exists(key).await {
            return Err(Error::ResourceNotFound {
                kind: key.kind().as_str().into(),
                name: key.to_string(),
            });
        }
        self.finalizers.write().await.insert(key.clone());
        Ok(())
    }

    async fn has_finalizer(&self, key: &ResourceKey) -> Result<bool> {
        Ok(self.finalizers.read().await.contains(key))
    }

    async fn save_operation(&self, target: &ResourceKey, record: &OperationRecord) -> Result<()> {
        self.set_operation(target, Some(record.clone())).await
    }

    async fn remove_operation(&self, target: &ResourceKey) -> Result<()> {
        self.set_operation(target, None).await
    }

    async fn load_operations(&self) -> Result<Vec<(ResourceKey, OperationRecord)>> {
        let mut ops = Vec::new();
        for record in self.instances.read().await.values() {
            if let Some(op) = &record.operation {
                ops.push((ResourceKey::Instance(record.handle.clone()), op.clone()));
            }
        }
        for record in self.shares.read().await.values() {
            if let Some(op) = &record.operation {
                ops.push((ResourceKey::Share(record.handle.clone()), op.clone()));
            }
        }
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multishare::capacity::LifecycleState;
    use crate::multishare::constraints::TIB;
    use assert_matches::assert_matches;

    fn instance_record(name: &str) -> InstanceRecord {
        InstanceRecord {
            handle: InstanceHandle::new("p", "l", name),
            storage_class_key: "default".into(),
            capacity_bytes: TIB,
            max_shares: 10,
            share_names: Vec::new(),
            state: LifecycleState::Pending,
            operation: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_finalizer_blocks_removal() {
        let store = MemoryStore::new();
        let record = instance_record("fs-1");
        let key = ResourceKey::Instance(record.handle.clone());
        store.save_instance(&record).await.unwrap();
        store.set_finalizer(&key, true).await.unwrap();

        assert_matches!(
            store.remove_instance(&record.handle).await,
            Err(Error::FinalizerPresent { .. })
        );
        store.set_finalizer(&key, false).await.unwrap();
        store.remove_instance(&record.handle).await.unwrap();
        assert!(store.load_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_fault_fails_one_write() {
        let store = MemoryStore::new();
        let record = instance_record("fs-1");
        let key = ResourceKey::Instance(record.handle.clone());
        store.save_instance(&record).await.unwrap();
        store.set_finalizer(&key, true).await.unwrap();

        store.fail_next_write(key.clone());
        assert_matches!(
            store.set_finalizer(&key, false).await,
            Err(Error::Backend { .. })
        );
        assert!(store.has_finalizer(&key).await.unwrap());
        store.set_finalizer(&key, false).await.unwrap();
        assert!(!store.has_finalizer(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_finalizer_requires_resource() {
        let store = MemoryStore::new();
        let key = ResourceKey::Instance(InstanceHandle::new("p", "l", "ghost"));
        assert_matches!(
            store.set_finalizer(&key, true).await,
            Err(Error::ResourceNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_operation_records() {
        let store = MemoryStore::new();
        let record = instance_record("fs-1");
        let key = ResourceKey::Instance(record.handle.clone());
        store.save_instance(&record).await.unwrap();

        let op = OperationRecord {
            op_type: "instancecreate".into(),
            status: "running".into(),
            capacity_bytes: TIB,
            backend_name: None,
            start_time: "2023-04-10T22:58:52.014103834Z".into(),
            last_observed: "2023-04-10T22:58:52.014103834Z".into(),
            unknown_since: None,
            failed_at: None,
            error: None,
        };
        store.save_operation(&key, &op).await.unwrap();
        assert_eq!(store.load_operations().await.unwrap(), vec![(key.clone(), op)]);

        store.remove_operation(&key).await.unwrap();
        assert!(store.load_operations().await.unwrap().is_empty());
    }
}
