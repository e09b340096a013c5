//! InstanceInfo CRD
//!
//! Durable record of a backing instance: its handle, capacity, the shares
//! it hosts and any operation in flight against it.

use crate::domain::ports::InstanceRecord;
use crate::error::Result;
use crate::multishare::capacity::LifecycleState;
use crate::multishare::identity::InstanceHandle;
use crate::multishare::operations::OperationRecord;
use kube::api::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// InstanceInfo CRD
// =============================================================================

/// InstanceInfo tracks one multishare backing instance.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multishare.filestore.csi.storage.gke.io",
    version = "v1beta1",
    kind = "InstanceInfo",
    plural = "instanceinfos",
    shortname = "ii",
    status = "InstanceInfoStatus",
    printcolumn = r#"{"name": "Instance", "type": "string", "jsonPath": ".spec.instanceHandle"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".status.capacityBytes"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfoSpec {
    /// `projects/<p>/locations/<l>/instances/<name>`
    pub instance_handle: String,

    /// Desired capacity in bytes
    pub capacity_bytes: u64,

    /// Storage-class key the instance serves
    pub storage_class_key: String,

    /// Share cap of the instance's packing profile
    #[serde(default = "default_max_shares")]
    pub max_shares: u32,
}

/// Observed state of an instance
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfoStatus {
    #[serde(default)]
    pub state: LifecycleState,

    /// Confirmed capacity in bytes
    #[serde(default)]
    pub capacity_bytes: u64,

    /// Shares hosted on this instance
    #[serde(default)]
    pub share_names: Vec<String>,

    #[serde(default)]
    pub operation: Option<OperationRecord>,

    #[serde(default)]
    pub error: Option<String>,
}

fn default_max_shares() -> u32 {
    crate::multishare::constraints::MAX_SHARES_PER_INSTANCE
}

/// Object name for an instance: `<name>.<location>.<project>`
pub fn instance_object_name(handle: &InstanceHandle) -> String {
    format!("{}.{}.{}", handle.name, handle.location, handle.project).to_lowercase()
}

impl InstanceInfo {
    /// Build the custom resource for a record
    pub fn from_record(record: &InstanceRecord) -> Self {
        InstanceInfo {
            metadata: ObjectMeta {
                name: Some(instance_object_name(&record.handle)),
                ..ObjectMeta::default()
            },
            spec: InstanceInfoSpec {
                instance_handle: record.handle.to_string(),
                capacity_bytes: record.capacity_bytes,
                storage_class_key: record.storage_class_key.clone(),
                max_shares: record.max_shares,
            },
            status: Some(InstanceInfoStatus {
                state: record.state,
                capacity_bytes: record.capacity_bytes,
                share_names: record.share_names.clone(),
                operation: record.operation.clone(),
                error: record.error.clone(),
            }),
        }
    }

    /// Decode the custom resource back into a record
    pub fn to_record(&self) -> Result<InstanceRecord> {
        let status = self.status.clone().unwrap_or_default();
        Ok(InstanceRecord {
            handle: self.spec.instance_handle.parse()?,
            storage_class_key: self.spec.storage_class_key.clone(),
            capacity_bytes: self.spec.capacity_bytes,
            max_shares: self.spec.max_shares,
            share_names: status.share_names,
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
