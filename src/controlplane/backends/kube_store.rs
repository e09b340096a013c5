//! Resource store backed by the InstanceInfo and ShareInfo custom resources

use crate::crd::{
    instance_object_name, share_object_name, InstanceInfo, ShareInfo, FINALIZER,
};
use crate::domain::ports::{InstanceRecord, ResourceStore, ShareRecord};
use crate::error::{Error, Result};
use crate::multishare::identity::{InstanceHandle, ResourceKey, ShareHandle};
use crate::multishare::operations::OperationRecord;
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, warn};

const FIELD_MANAGER: &str = "multishare-controller";

/// Persists records as cluster-scoped custom resources
pub struct KubeStore {
    instances: Api<InstanceInfo>,
    shares: Api<ShareInfo>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            instances: Api::all(client.clone()),
            shares: Api::all(client),
        }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    async fn finalizers(&self, key: &ResourceKey) -> Result<Option<Vec<String>>> {
        let meta = match key {
            ResourceKey::Instance(h) => self
                .instances
                .get_opt(&instance_object_name(h))
                .await?
                .map(|o| o.metadata),
            ResourceKey::Share(h) => self
                .shares
                .get_opt(&share_object_name(h))
                .await?
                .map(|o| o.metadata),
        };
        Ok(meta.map(|m| m.finalizers.unwrap_or_default()))
    }

    async fn patch_status(&self, target: &ResourceKey, status: serde_json::Value) -> Result<()> {
        let patch = Patch::Merge(json!({ "status": status }));
        let params = PatchParams::default();
        match target {
            ResourceKey::Instance(h) => {
                self.instances
                    .patch_status(&instance_object_name(h), &params, &patch)
                    .await?;
            }
            ResourceKey::Share(h) => {
                self.shares
                    .patch_status(&share_object_name(h), &params, &patch)
                    .await?;
            }
        }
        Ok(())
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn save_instance(&self, record: &InstanceRecord) -> Result<()> {
        let info = InstanceInfo::from_record(record);
        let name = instance_object_name(&record.handle);
        self.instances
            .patch(&name, &Self::apply_params(), &Patch::Apply(&info))
            .await?;
        let status = serde_json::to_value(&info.status)?;
        self.patch_status(&ResourceKey::Instance(record.handle.clone()), status)
            .await?;
        debug!("Saved InstanceInfo {}", name);
        Ok(())
    }

    async fn save_share(&self, record: &ShareRecord) -> Result<()> {
        let info = ShareInfo::from_record(record);
        let name = share_object_name(&record.handle);
        self.shares
            .patch(&name, &Self::apply_params(), &Patch::Apply(&info))
            .await?;
        let status = serde_json::to_value(&info.status)?;
        self.patch_status(&ResourceKey::Share(record.handle.clone()), status)
            .await?;
        debug!("Saved ShareInfo {}", name);
        Ok(())
    }

    async fn load_instances(&self) -> Result<Vec<InstanceRecord>> {
        let list = self.instances.list(&ListParams::default()).await?;
        let mut records = Vec::with_capacity(list.items.len());
        for item in list.items {
            match item.to_record() {
                Ok(r) => records.push(r),
                Err(e) => warn!("Skipping malformed InstanceInfo {:?}: {}", item.metadata.name, e),
            }
        }
        Ok(records)
    }

    async fn load_shares(&self) -> Result<Vec<ShareRecord>> {
        let list = self.shares.list(&ListParams::default()).await?;
        let mut records = Vec::with_capacity(list.items.len());
        for item in list.items {
            match item.to_record() {
                Ok(r) => records.push(r),
                Err(e) => warn!("Skipping malformed ShareInfo {:?}: {}", item.metadata.name, e),
            }
        }
        Ok(records)
    }

    async fn remove_instance(&self, handle: &InstanceHandle) -> Result<()> {
        let name = instance_object_name(handle);
        let Some(info) = self.instances.get_opt(&name).await? else {
            return Ok(());
        };
        if info.has_finalizer(FINALIZER) {
            return Err(Error::FinalizerPresent {
                resource: handle.to_string(),
            });
        }
        match self.instances.delete(&name, &DeleteParams::default()).await {
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
            Ok(_) => Ok(()),
        }
    }

    async fn remove_share(&self, handle: &ShareHandle) -> Result<()> {
        let name = share_object_name(handle);
        let Some(info) = self.shares.get_opt(&name).await? else {
            return Ok(());
        };
        if info.has_finalizer(FINALIZER) {
            return Err(Error::FinalizerPresent {
                resource: handle.to_string(),
            });
        }
        match self.shares.delete(&name, &DeleteParams::default()).await {
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
            Ok(_) => Ok(()),
        }
    }

    async fn set_finalizer(&self, key: &ResourceKey, present: bool) -> Result<()> {
        let Some(mut finalizers) = self.finalizers(key).await? else {
            if present {
                return Err(Error::ResourceNotFound {
                    kind: key.kind().as_str().into(),
                    name: key.to_string(),
                });
            }
            return Ok(());
        };

        let has = finalizers.iter().any(|f| f == FINALIZER);
        match (present, has) {
            (true, false) => finalizers.push(FINALIZER.to_string()),
            (false, true) => finalizers.retain(|f| f != FINALIZER),
            _ => return Ok(()),
        }

        let patch = Patch::Merge(json!({ "metadata": { "finalizers": finalizers } }));
        let params = PatchParams::default();
        match key {
            ResourceKey::Instance(h) => {
                self.instances
                    .patch(&instance_object_name(h), &params, &patch)
                    .await?;
            }
            ResourceKey::Share(h) => {
                self.shares
                    .patch(&share_object_name(h), &params, &patch)
                    .await?;
            }
        }
        Ok(())
    }

    async fn has_finalizer(&self, key: &ResourceKey) -> Result<bool> {
        Ok(self
            .finalizers(key)
            .await?
            .is_some_and(|f| f.iter().any(|x| x == FINALIZER)))
    }

    async fn save_operation(&self, target: &ResourceKey, record: &OperationRecord) -> Result<()> {
        self.patch_status(target, json!({ "operation": record })).await
    }

    async fn remove_operation(&self, target: &ResourceKey) -> Result<()> {
        match self.patch_status(target, json!({ "operation": null })).await {
            Err(Error::Kube(e)) if is_not_found(&e) => Err(Error::ResourceNotFound {
                kind: target.kind().as_str().into(),
                name: target.to_string(),
            }),
            other => other,
        }
    }

    async fn load_operations(&self) -> Result<Vec<(ResourceKey, OperationRecord)>> {
        let mut ops = Vec::new();
        for record in self.load_instances().await? {
            if let Some(op) = record.operation {
                ops.push((ResourceKey::Instance(record.handle), op));
            }
        }
        for record in self.load_shares().await? {
            if let Some(op) = record.operation {
                ops.push((ResourceKey::Share(record.handle), op));
            }
        }
        Ok(ops)
    }
}
