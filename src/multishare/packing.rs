//! Packing Allocator
//!
//! Decides which instance a new share lands on, or directs the creation of a
//! new instance sized to the step policy. Decisions are advisory: nothing is
//! debited from the capacity model until the resulting operation completes.

use super::capacity::InstanceEntry;
use super::constraints::{storage_class_key, Constraints};
use super::identity::InstanceHandle;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

// =============================================================================
// Request
// =============================================================================

/// A validated-at-the-edge request for a new share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRequest {
    /// Share name, unique per instance
    pub name: String,
    /// Requested capacity in bytes
    pub capacity_bytes: u64,
    pub project: String,
    pub location: String,
    /// Storage-class parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ShareRequest {
    pub fn new(
        name: impl Into<String>,
        capacity_bytes: u64,
        project: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            capacity_bytes,
            project: project.into(),
            location: location.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn storage_class_key(&self) -> String {
        storage_class_key(&self.parameters)
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Order in which eligible instances are scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlacementOrder {
    /// Highest fill ratio first, minimizing instance count
    #[default]
    MostFullFirst,
    /// Lowest fill ratio first, spreading load
    LeastFullFirst,
    /// Rotate the starting instance on every placement
    RoundRobin,
}

/// Packing policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackingPolicy {
    pub order: PlacementOrder,
    /// Grow an existing instance before creating a new one
    pub allow_grow: bool,
}

impl Default for PackingPolicy {
    fn default() -> Self {
        Self {
            order: PlacementOrder::default(),
            allow_grow: true,
        }
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Result of a placement calculation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementDecision {
    /// Existing instance with headroom and a free slot
    Existing { instance: InstanceHandle },
    /// Existing instance that must grow to `new_capacity` first
    Grow {
        instance: InstanceHandle,
        new_capacity: u64,
    },
    /// Instance to be created before the share
    NewInstance {
        instance: InstanceHandle,
        capacity: u64,
    },
}

impl PlacementDecision {
    pub fn instance(&self) -> &InstanceHandle {
        match self {
            PlacementDecision::Existing { instance } => instance,
            PlacementDecision::Grow { instance, .. } => instance,
            PlacementDecision::NewInstance { instance, .. } => instance,
        }
    }

    /// Label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            PlacementDecision::Existing { .. } => "existing",
            PlacementDecision::Grow { .. } => "grow",
            PlacementDecision::NewInstance { .. } => "new_instance",
        }
    }
}

// =============================================================================
// Packing Allocator
// =============================================================================

/// Capacity-aware placement of shares onto instances
pub struct PackingAllocator {
    constraints: Constraints,
    policy: PackingPolicy,
    cursor: AtomicUsize,
}

impl PackingAllocator {
    pub fn new(constraints: Constraints, policy: PackingPolicy) -> Self {
        Self {
            constraints,
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn policy(&self) -> &PackingPolicy {
        &self.policy
    }

    /// Constraints in effect for a request, validated against its size
    pub fn effective_constraints(&self, request: &ShareRequest) -> Result<Constraints> {
        let constraints = self.constraints.for_parameters(&request.parameters)?;
        constraints.validate_share_size(request.capacity_bytes)?;
        Ok(constraints)
    }

    /// Select a placement for `request`
    ///
    /// `candidates` is a snapshot of instances; `is_busy` reports instances
    /// with a non-terminal operation, which are never chosen.
    pub fn place(
        &self,
        request: &ShareRequest,
        candidates: &[InstanceEntry],
        is_busy: impl Fn(&InstanceHandle) -> bool,
    ) -> Result<PlacementDecision> {
        let constraints = self.effective_constraints(request)?;
        let class_key = request.storage_class_key();

        let mut eligible: Vec<&InstanceEntry> = candidates
            .iter()
            .filter(|e| {
                e.storage_class_key == class_key
                    && e.handle.project == request.project
                    && e.handle.location == request.location
                    && !is_busy(&e.handle)
            })
            .collect();
        self.order(&mut eligible);

        debug!(
            "Scanning {} eligible instances for share {} ({} bytes)",
            eligible.len(),
            request.name,
            request.capacity_bytes
        );

        if let Some(entry) = eligible.iter().find(|e| e.can_fit(request.capacity_bytes)) {
            return Ok(PlacementDecision::Existing {
                instance: entry.handle.clone(),
            });
        }

        if self.policy.allow_grow {
            let grow = eligible.iter().find_map(|e| {
                e.growth_needed(request.capacity_bytes, &constraints)
                    .filter(|delta| *delta > 0)
                    .map(|delta| (e, e.total_capacity + delta))
            });
            if let Some((entry, new_capacity)) = grow {
                return Ok(PlacementDecision::Grow {
                    instance: entry.handle.clone(),
                    new_capacity,
                });
            }
        }

        let capacity = constraints
            .new_instance_size(request.capacity_bytes)
            .ok_or_else(|| Error::CapacityExhausted {
                requested: request.capacity_bytes,
                reason: format!(
                    "a fresh instance is capped at {} bytes",
                    constraints.max_instance_size
                ),
            })?;

        Ok(PlacementDecision::NewInstance {
            instance: InstanceHandle::new(
                request.project.clone(),
                request.location.clone(),
                self.new_instance_name(),
            ),
            capacity,
        })
    }

    fn order(&self, eligible: &mut Vec<&InstanceEntry>) {
        match self.policy.order {
            PlacementOrder::MostFullFirst => eligible.sort_by(|a, b| {
                b.fill_ratio()
                    .total_cmp(&a.fill_ratio())
                    .then_with(|| a.handle.cmp(&b.handle))
            }),
            PlacementOrder::LeastFullFirst => eligible.sort_by(|a, b| {
                a.fill_ratio()
                    .total_cmp(&b.fill_ratio())
                    .then_with(|| a.handle.cmp(&b.handle))
            }),
            PlacementOrder::RoundRobin => {
                eligible.sort_by(|a, b| a.handle.cmp(&b.handle));
                if !eligible.is_empty() {
                    let start = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
                    eligible.rotate_left(start);
                }
            }
        }
    }

    fn new_instance_name(&self) -> String {
        format!(
            "{}{}",
            self.constraints.instance_prefix,
            uuid::Uuid::new_v4().simple()
        )
    }
}

impl Default for PackingAllocator {
    fn default() -> Self {
        Self::new(Constraints::default(), PackingPolicy::default())
    }
}
