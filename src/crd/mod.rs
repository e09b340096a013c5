//! Custom Resource Definitions for multishare persistence
//!
//! This module contains all CRD types:
//! - InstanceInfo: a backing instance and the shares it hosts
//! - ShareInfo: a share and its owning instance

pub mod instance_info;
pub mod share_info;

pub use instance_info::*;
pub use share_info::*;

/// Protective marker attached to instance and share resources
pub const FINALIZER: &str = "multishare.filestore.csi.storage.gke.io/resource-cleanup-protection";
