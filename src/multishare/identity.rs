//! Resource Identity
//!
//! Path-like identifiers for instances, shares and orchestrator volumes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const INSTANCE_URI_SPLIT_LEN: usize = 6;
pub const SHARE_URI_SPLIT_LEN: usize = 8;
pub const VOLUME_ID_SPLIT_LEN: usize = 6;

/// Leading segment of every multishare volume identifier
pub const VOLUME_ID_MODE: &str = "modeMultishare";

/// Split a `/`-separated identifier, requiring exactly `expected` non-empty segments
pub fn split_resource_uri(s: &str, expected: usize) -> Result<Vec<&str>> {
    let segments: Vec<&str> = s.split('/').collect();
    if segments.len() != expected || segments.iter().any(|seg| seg.is_empty()) {
        return Err(Error::MalformedIdentity {
            value: s.to_string(),
            expected,
            found: segments.len(),
        });
    }
    Ok(segments)
}

fn expect_literal(s: &str, segment: &str, literal: &str, expected: usize) -> Result<()> {
    if segment == literal {
        Ok(())
    } else {
        Err(Error::MalformedIdentity {
            value: s.to_string(),
            expected,
            found: expected,
        })
    }
}

// =============================================================================
// Instance Handle
// =============================================================================

/// `projects/<project>/locations/<location>/instances/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceHandle {
    pub project: String,
    pub location: String,
    pub name: String,
}

impl InstanceHandle {
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            location: location.into(),
            name: name.into(),
        }
    }

    /// Handle of a share hosted on this instance
    pub fn share(&self, name: impl Into<String>) -> ShareHandle {
        ShareHandle {
            instance: self.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/instances/{}",
            self.project, self.location, self.name
        )
    }
}

impl FromStr for InstanceHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let seg = split_resource_uri(s, INSTANCE_URI_SPLIT_LEN)?;
        expect_literal(s, seg[0], "projects", INSTANCE_URI_SPLIT_LEN)?;
        expect_literal(s, seg[2], "locations", INSTANCE_URI_SPLIT_LEN)?;
        expect_literal(s, seg[4], "instances", INSTANCE_URI_SPLIT_LEN)?;
        Ok(Self::new(seg[1], seg[3], seg[5]))
    }
}

impl TryFrom<String> for InstanceHandle {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<InstanceHandle> for String {
    fn from(h: InstanceHandle) -> String {
        h.to_string()
    }
}

// =============================================================================
// Share Handle
// =============================================================================

/// `projects/<project>/locations/<location>/instances/<instance>/shares/<name>`
///
/// The embedded instance handle is a lookup key, not ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShareHandle {
    pub instance: InstanceHandle,
    pub name: String,
}

impl fmt::Display for ShareHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/shares/{}", self.instance, self.name)
    }
}

impl FromStr for ShareHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let seg = split_resource_uri(s, SHARE_URI_SPLIT_LEN)?;
        expect_literal(s, seg[0], "projects", SHARE_URI_SPLIT_LEN)?;
        expect_literal(s, seg[2], "locations", SHARE_URI_SPLIT_LEN)?;
        expect_literal(s, seg[4], "instances", SHARE_URI_SPLIT_LEN)?;
        expect_literal(s, seg[6], "shares", SHARE_URI_SPLIT_LEN)?;
        Ok(InstanceHandle::new(seg[1], seg[3], seg[5]).share(seg[7]))
    }
}

impl TryFrom<String> for ShareHandle {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ShareHandle> for String {
    fn from(h: ShareHandle) -> String {
        h.to_string()
    }
}

// =============================================================================
// Volume ID
// =============================================================================

/// Orchestrator-facing identifier:
/// `modeMultishare/<storage-class-key>/<project>/<location>/<instance>/<share>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId {
    pub storage_class_key: String,
    pub share: ShareHandle,
}

impl VolumeId {
    pub fn new(storage_class_key: impl Into<String>, share: ShareHandle) -> Self {
        Self {
            storage_class_key: storage_class_key.into(),
            share,
        }
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = &self.share.instance;
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            VOLUME_ID_MODE, self.storage_class_key, i.project, i.location, i.name, self.share.name
        )
    }
}

impl FromStr for VolumeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let seg = split_resource_uri(s, VOLUME_ID_SPLIT_LEN)?;
        expect_literal(s, seg[0], VOLUME_ID_MODE, VOLUME_ID_SPLIT_LEN)?;
        Ok(Self::new(
            seg[1],
            InstanceHandle::new(seg[2], seg[3], seg[4]).share(seg[5]),
        ))
    }
}

// =============================================================================
// Resource Key
// =============================================================================

/// Identity of anything an operation can target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "handle")]
pub enum ResourceKey {
    Instance(InstanceHandle),
    Share(ShareHandle),
}

impl ResourceKey {
    /// Instance this resource lives on
    pub fn instance(&self) -> &InstanceHandle {
        match self {
            ResourceKey::Instance(h) => h,
            ResourceKey::Share(h) => &h.instance,
        }
    }

    pub fn kind(&self) -> super::operations::ResourceKind {
        match self {
            ResourceKey::Instance(_) => super::operations::ResourceKind::Instance,
            ResourceKey::Share(_) => super::operations::ResourceKind::Share,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Instance(h) => write!(f, "{}", h),
            ResourceKey::Share(h) => write!(f, "{}", h),
        }
    }
}

impl From<InstanceHandle> for ResourceKey {
    fn from(h: InstanceHandle) -> Self {
        ResourceKey::Instance(h)
    }
}

impl From<ShareHandle> for ResourceKey {
    fn from(h: ShareHandle) -> Self {
        ResourceKey::Share(h)
    }
}
