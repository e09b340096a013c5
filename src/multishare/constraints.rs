//! Packing Constraints
//!
//! Immutable capacity and policy limits handed to every component at
//! construction, and the per-storage-class profile derived from them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Units and Defaults
// =============================================================================

pub const GIB: u64 = 1 << 30;
pub const TIB: u64 = 1 << 40;

pub const MIN_INSTANCE_SIZE_BYTES: u64 = TIB;
pub const MAX_INSTANCE_SIZE_BYTES: u64 = 10 * TIB;
pub const MIN_SHARE_SIZE_BYTES: u64 = 100 * GIB;
pub const MAX_SHARE_SIZE_BYTES: u64 = TIB;
pub const MAX_SHARES_PER_INSTANCE: u32 = 10;
pub const DEFAULT_STEP_SIZE_BYTES: u64 = MIN_INSTANCE_SIZE_BYTES;
pub const NEW_INSTANCE_PREFIX: &str = "fs-";

/// Minimum share size once a class opts into configurable packing
pub const CONFIGURABLE_PACK_MIN_SHARE_SIZE_BYTES: u64 = 10 * GIB;

/// Storage-class parameter selecting the configurable packing profile
pub const PARAM_MAX_VOLUME_SIZE: &str = "max-volume-size";

/// Storage-class parameter partitioning instances between classes
pub const PARAM_STORAGE_CLASS_ID: &str = "storage_gke_io_storage-class-id";

/// Key used when a request carries no storage-class id
pub const DEFAULT_STORAGE_CLASS_KEY: &str = "default";

const ALLOWED_MAX_VOLUME_SIZES: [u64; 4] = [128 * GIB, 256 * GIB, 512 * GIB, 1024 * GIB];

// =============================================================================
// Constraints
// =============================================================================

/// Capacity and count limits for instances and shares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Constraints {
    pub min_instance_size: u64,
    pub max_instance_size: u64,
    pub min_share_size: u64,
    pub max_share_size: u64,
    pub max_shares_per_instance: u32,
    pub step_size: u64,
    pub instance_prefix: String,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            min_instance_size: MIN_INSTANCE_SIZE_BYTES,
            max_instance_size: MAX_INSTANCE_SIZE_BYTES,
            min_share_size: MIN_SHARE_SIZE_BYTES,
            max_share_size: MAX_SHARE_SIZE_BYTES,
            max_shares_per_instance: MAX_SHARES_PER_INSTANCE,
            step_size: DEFAULT_STEP_SIZE_BYTES,
            instance_prefix: NEW_INSTANCE_PREFIX.to_string(),
        }
    }
}

impl Constraints {
    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.step_size == 0 {
            return Err(Error::Configuration("stepSize must be positive".into()));
        }
        if self.max_shares_per_instance == 0 {
            return Err(Error::Configuration(
                "maxSharesPerInstance must be positive".into(),
            ));
        }
        if self.min_instance_size == 0 || self.min_instance_size > self.max_instance_size {
            return Err(Error::Configuration(format!(
                "instance size bounds [{}, {}] are invalid",
                self.min_instance_size, self.max_instance_size
            )));
        }
        if self.min_share_size == 0 || self.min_share_size > self.max_share_size {
            return Err(Error::Configuration(format!(
                "share size bounds [{}, {}] are invalid",
                self.min_share_size, self.max_share_size
            )));
        }
        if self.max_share_size > self.max_instance_size {
            return Err(Error::Configuration(
                "maxShareSize exceeds maxInstanceSize".into(),
            ));
        }
        if self.instance_prefix.is_empty() {
            return Err(Error::Configuration("instancePrefix is empty".into()));
        }
        Ok(())
    }

    /// Reject share sizes outside `[min_share_size, max_share_size]`
    pub fn validate_share_size(&self, requested: u64) -> Result<()> {
        if requested < self.min_share_size || requested > self.max_share_size {
            return Err(Error::Validation(format!(
                "share size {} bytes outside allowed range [{}, {}]",
                requested, self.min_share_size, self.max_share_size
            )));
        }
        Ok(())
    }

    /// Round a byte count up to the next multiple of the step size
    pub fn round_up_to_step(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.step_size).saturating_mul(self.step_size)
    }

    /// Size of a fresh instance for a share, `None` if no instance could hold it
    pub fn new_instance_size(&self, share_bytes: u64) -> Option<u64> {
        let size = self
            .round_up_to_step(share_bytes)
            .max(self.min_instance_size)
            .min(self.max_instance_size);
        (size >= share_bytes).then_some(size)
    }

    /// Derive the constraints for a request's storage-class parameters
    ///
    /// Without `max-volume-size` the constraints are returned unchanged.
    pub fn for_parameters(&self, params: &BTreeMap<String, String>) -> Result<Constraints> {
        let Some(raw) = params.get(PARAM_MAX_VOLUME_SIZE) else {
            return Ok(self.clone());
        };

        let max_volume = parse_capacity(raw)
            .map_err(|e| Error::Validation(format!("{}: {}", PARAM_MAX_VOLUME_SIZE, e)))?;

        if !ALLOWED_MAX_VOLUME_SIZES.contains(&max_volume) {
            return Err(Error::Validation(format!(
                "{} {:?} is not one of 128Gi, 256Gi, 512Gi, 1Ti",
                PARAM_MAX_VOLUME_SIZE, raw
            )));
        }

        let shares = (self.max_instance_size / max_volume).max(1);
        Ok(Constraints {
            min_share_size: CONFIGURABLE_PACK_MIN_SHARE_SIZE_BYTES,
            max_share_size: max_volume,
            max_shares_per_instance: u32::try_from(shares).unwrap_or(u32::MAX),
            ..self.clone()
        })
    }
}

/// Parse capacity string (e.g., "100Gi", "1Ti") to bytes
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Validation("empty capacity string".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::Validation(format!("invalid number: {}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1 << 10,
        "M" | "MB" | "MI" | "MIB" => 1 << 20,
        "G" | "GB" | "GI" | "GIB" => GIB,
        "T" | "TB" | "TI" | "TIB" => TIB,
        _ => {
            return Err(Error::Validation(format!("unknown unit: {}", unit_str)));
        }
    };

    Ok((num * multiplier as f64) as u64)
}

/// Storage-class key of a request
pub fn storage_class_key(params: &BTreeMap<String, String>) -> String {
    params
        .get(PARAM_STORAGE_CLASS_ID)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_STORAGE_CLASS_KEY.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_consistent() {
        let c = Constraints::default();
        c.validate().unwrap();
        assert_eq!(c.step_size, 1024 * GIB);
        assert_eq!(c.instance_prefix, "fs-");
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let c = Constraints {
            min_share_size: 2 * TIB,
            ..Constraints::default()
        };
        assert_matches!(c.validate(), Err(Error::Configuration(_)));

        let c = Constraints {
            step_size: 0,
            ..Constraints::default()
        };
        assert_matches!(c.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_share_size_bounds() {
        let c = Constraints::default();
        assert!(c.validate_share_size(100 * GIB).is_ok());
        assert!(c.validate_share_size(TIB).is_ok());
        assert_matches!(c.validate_share_size(99 * GIB), Err(Error::Validation(_)));
        assert_matches!(
            c.validate_share_size(TIB + TIB / 2),
            Err(Error::Validation(_))
        );
    }

    #[test]
    fn test_new_instance_size() {
        let c = Constraints::default();
        assert_eq!(c.new_instance_size(100 * GIB), Some(TIB));
        assert_eq!(c.new_instance_size(TIB), Some(TIB));
        assert_eq!(c.new_instance_size(TIB + 1), Some(2 * TIB));
        assert_eq!(c.new_instance_size(11 * TIB), None);
    }

    #[test]
    fn test_configurable_pack_profile() {
        let c = Constraints::default();
        let mut params = BTreeMap::new();
        params.insert(PARAM_MAX_VOLUME_SIZE.to_string(), "128Gi".to_string());

        let profile = c.for_parameters(&params).unwrap();
        assert_eq!(profile.max_shares_per_instance, 80);
        assert_eq!(profile.max_share_size, 128 * GIB);
        assert_eq!(profile.min_share_size, 10 * GIB);

        params.insert(PARAM_MAX_VOLUME_SIZE.to_string(), "1Ti".to_string());
        assert_eq!(c.for_parameters(&params).unwrap().max_shares_per_instance, 10);

        params.insert(PARAM_MAX_VOLUME_SIZE.to_string(), "300Gi".to_string());
        assert_matches!(c.for_parameters(&params), Err(Error::Validation(_)));

        assert_eq!(c.for_parameters(&BTreeMap::new()).unwrap(), c);
    }

    #[test]
    fn test_storage_class_key() {
        let mut params = BTreeMap::new();
        assert_eq!(storage_class_key(&params), DEFAULT_STORAGE_CLASS_KEY);
        params.insert(PARAM_STORAGE_CLASS_ID.to_string(), "sc-1".to_string());
        assert_eq!(storage_class_key(&params), "sc-1");
    }

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("100").unwrap(), 100);
        assert_eq!(parse_capacity("1Ki").unwrap(), 1024);
        assert_eq!(parse_capacity("100Gi").unwrap(), 100 * GIB);
        assert_eq!(parse_capacity("1.5Ti").unwrap(), TIB + TIB / 2);

        assert!(parse_capacity("").is_err());
        assert!(parse_capacity("abc").is_err());
        assert!(parse_capacity("100X").is_err());
    }
}
