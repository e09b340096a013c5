//! Backend and Store Adapters
//!
//! Provides adapters for the controller's external collaborators:
//! - InMemoryFilestore: simulated long-running operation backend
//! - MemoryStore: process-local resource store
//! - KubeStore: resource store over the InstanceInfo/ShareInfo CRDs

pub mod filestore;
pub mod kube_store;
pub mod memory;

pub use filestore::*;
pub use kube_store::*;
pub use memory::*;

use crate::domain::ports::ResourceStore;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Factory for creating resource store adapters
pub struct StoreFactory;

impl StoreFactory {
    /// Create a store by name; `kube` needs a client
    pub fn create(name: &str, client: Option<kube::Client>) -> Result<Arc<dyn ResourceStore>> {
        match (name.to_lowercase().as_str(), client) {
            ("memory", _) => Ok(Arc::new(MemoryStore::new())),
            ("kube" | "kubernetes", Some(client)) => Ok(Arc::new(KubeStore::new(client))),
            ("kube" | "kubernetes", None) => Err(Error::Configuration(
                "kube store requires a cluster client".into(),
            )),
            (other, _) => Err(Error::Configuration(format!("unknown store {:?}", other))),
        }
    }
}
