//! Writes the model's view of a resource, with its operation, to the store

use super::capacity::CapacityModel;
use super::identity::{InstanceHandle, ResourceKey, ShareHandle};
use super::operations::{Operation, OperationId, OperationRegistry};
use crate::domain::ports::{InstanceRecord, ResourceStore, ShareRecord};
use crate::error::Result;
use std::sync::Arc;

/// Builds durable records from the capacity model and operation registry
pub struct StateWriter {
    store: Arc<dyn ResourceStore>,
    model: Arc<CapacityModel>,
    registry: Arc<OperationRegistry>,
}

impl StateWriter {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        model: Arc<CapacityModel>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            store,
            model,
            registry,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Operation that targets `key` itself, live or retained after failure
    fn operation_for(&self, key: &ResourceKey) -> Option<Operation> {
        self.registry
            .active_for(key)
            .filter(|op| &op.target == key)
            .or_else(|| self.registry.failed_for(key))
    }

    pub fn instance_record(&self, handle: &InstanceHandle) -> Option<InstanceRecord> {
        let entry = self.model.instance(handle)?;
        let op = self.operation_for(&ResourceKey::Instance(handle.clone()));
        let mut share_names: Vec<String> = self
            .model
            .shares()
            .into_iter()
            .filter(|s| s.instance() == handle)
            .map(|s| s.handle.name)
            .collect();
        share_names.sort();

        Some(InstanceRecord {
            handle: entry.handle,
            storage_class_key: entry.storage_class_key,
            capacity_bytes: entry.total_capacity,
            max_shares: entry.max_shares,
            share_names,
            state: entry.state,
            error: op.as_ref().and_then(|op| op.error.clone()),
            operation: op.map(|op| op.to_record()),
        })
    }

    pub fn share_record(&self, handle: &ShareHandle) -> Option<ShareRecord> {
        let entry = self.model.share(handle)?;
        let op = self.operation_for(&ResourceKey::Share(handle.clone()));

        Some(ShareRecord {
            handle: entry.handle,
            storage_class_key: entry.storage_class_key,
            capacity_bytes: entry.capacity,
            state: entry.state,
            error: op.as_ref().and_then(|op| op.error.clone()),
            operation: op.map(|op| op.to_record()),
        })
    }

    /// Persist an instance as the model currently sees it
    pub async fn instance(&self, handle: &InstanceHandle) -> Result<()> {
        match self.instance_record(handle) {
            Some(record) => self.store.save_instance(&record).await,
            None => Ok(()),
        }
    }

    /// Persist a share as the model currently sees it
    pub async fn share(&self, handle: &ShareHandle) -> Result<()> {
        match self.share_record(handle) {
            Some(record) => self.store.save_share(&record).await,
            None => Ok(()),
        }
    }

    /// Persist whichever resource `key` names
    pub async fn resource(&self, key: &ResourceKey) -> Result<()> {
        match key {
            ResourceKey::Instance(h) => self.instance(h).await,
            ResourceKey::Share(h) => self.share(h).await,
        }
    }

    /// Persist the current state of an operation under its target
    pub async fn operation(&self, id: OperationId) -> Result<()> {
        match self.registry.get(id) {
            Some(op) => self.store.save_operation(&op.target, &op.to_record()).await,
            None => Ok(()),
        }
    }
}
