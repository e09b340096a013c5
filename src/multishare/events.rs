//! Capacity Model Events
//!
//! Emitted by the capacity model for external consumers to react to
//! instance and share lifecycle changes.

use super::capacity::LifecycleState;
use serde::{Deserialize, Serialize};

/// Events emitted by the capacity model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModelEvent {
    /// An instance became known to the model
    InstanceAdded {
        instance: String,
        capacity_bytes: u64,
    },

    /// An instance moved between lifecycle states
    InstanceStateChanged {
        instance: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    /// An instance's total capacity changed
    InstanceResized {
        instance: String,
        capacity_bytes: u64,
    },

    /// An instance was dropped from the model
    InstanceRemoved { instance: String },

    /// A share's capacity was debited from its instance
    ShareAttached {
        instance: String,
        share: String,
        capacity_bytes: u64,
    },

    /// A share's debit changed after a confirmed resize
    ShareResized {
        instance: String,
        share: String,
        capacity_bytes: u64,
    },

    /// A share's capacity was credited back to its instance
    ShareDetached { instance: String, share: String },

    /// A share's lifecycle state changed
    ShareStateChanged {
        instance: String,
        share: String,
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl ModelEvent {
    /// Get the instance associated with this event
    pub fn instance(&self) -> &str {
        match self {
            ModelEvent::InstanceAdded { instance, .. } => instance,
            ModelEvent::InstanceStateChanged { instance, .. } => instance,
            ModelEvent::InstanceResized { instance, .. } => instance,
            ModelEvent::InstanceRemoved { instance } => instance,
            ModelEvent::ShareAttached { instance, .. } => instance,
            ModelEvent::ShareResized { instance, .. } => instance,
            ModelEvent::ShareDetached { instance, .. } => instance,
            ModelEvent::ShareStateChanged { instance, .. } => instance,
        }
    }

    /// Get the share if this is a share-level event
    pub fn share(&self) -> Option<&str> {
        match self {
            ModelEvent::ShareAttached { share, .. } => Some(share),
            ModelEvent::ShareResized { share, .. } => Some(share),
            ModelEvent::ShareDetached { share, .. } => Some(share),
            ModelEvent::ShareStateChanged { share, .. } => Some(share),
            _ => None,
        }
    }
}
