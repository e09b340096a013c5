//! ShareInfo CRD
//!
//! Durable record of a share placed on an instance.

use super::instance_info::instance_object_name;
use crate::domain::ports::ShareRecord;
use crate::error::Result;
use crate::multishare::capacity::LifecycleState;
use crate::multishare::identity::{ShareHandle, VolumeId};
use crate::multishare::operations::OperationRecord;
use kube::api::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// ShareInfo CRD
// =============================================================================

/// ShareInfo tracks one share and the instance it was placed on.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multishare.filestore.csi.storage.gke.io",
    version = "v1beta1",
    kind = "ShareInfo",
    plural = "shareinfos",
    shortname = "si",
    status = "ShareInfoStatus",
    printcolumn = r#"{"name": "Share", "type": "string", "jsonPath": ".spec.shareHandle"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".status.capacityBytes"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfoSpec {
    /// `projects/<p>/locations/<l>/instances/<i>/shares/<name>`
    pub share_handle: String,

    /// Owning instance, set once at placement
    pub instance_handle: String,

    /// Orchestrator-facing volume identifier
    pub volume_id: String,

    /// Requested capacity in bytes
    pub capacity_bytes: u64,

    pub storage_class_key: String,
}

/// Observed state of a share
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfoStatus {
    #[serde(default)]
    pub state: LifecycleState,

    #[serde(default)]
    pub capacity_bytes: u64,

    #[serde(default)]
    pub operation: Option<OperationRecord>,

    #[serde(default)]
    pub error: Option<String>,
}

/// Object name for a share: `<share>.<instance object name>`
pub fn share_object_name(handle: &ShareHandle) -> String {
    format!("{}.{}", handle.name.to_lowercase(), instance_object_name(&handle.instance))
}

impl ShareInfo {
    pub fn from_record(record: &ShareRecord) -> Self {
        ShareInfo {
            metadata: ObjectMeta {
                name: Some(share_object_name(&record.handle)),
                ..ObjectMeta::default()
            },
            spec: ShareInfoSpec {
                share_handle: record.handle.to_string(),
                instance_handle: record.handle.instance.to_string(),
                volume_id: VolumeId::new(record.storage_class_key.clone(), record.handle.clone())
                    .to_string(),
                capacity_bytes: record.capacity_bytes,
                storage_class_key: record.storage_class_key.clone(),
            },
            status: Some(ShareInfoStatus {
                state: record.state,
                capacity_bytes: record.capacity_bytes,
                operation: record.operation.clone(),
                error: record.error.clone(),
            }),
        }
    }

    pub fn to_record(&self) -> Result<ShareRecord> {
        let status = self.status.clone().unwrap_or_default();
        Ok(ShareRecord {
            handle: self.spec.share_handle.parse()?,
            storage_class_key: self.spec.storage_class_key.clone(),
            capacity_bytes: self.spec.capacity_bytes,
            state: status.state,
            operation: status.operation,
            error: status.error,
        })
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }
}
