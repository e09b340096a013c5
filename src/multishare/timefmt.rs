//! Operation timestamp layout
//!
//! Timestamps exchanged with the operation backend always carry nine
//! fractional digits and a literal `Z`, e.g. `2023-04-10T22:58:52.014103834Z`.

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

pub const OP_TIME_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

/// Format a timestamp in the operation layout
pub fn format_op_time(t: &DateTime<Utc>) -> String {
    t.format(OP_TIME_LAYOUT).to_string()
}

/// Parse a timestamp that must match the operation layout exactly
pub fn parse_op_time(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, OP_TIME_LAYOUT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::TimeParse(format!("{:?}: {}", s, e)))
}

/// Serde adapter for `DateTime<Utc>` fields in the operation layout
pub mod serde_op_time {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&format_op_time(t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_op_time(&raw).map_err(serde::de::Error::custom)
    }

    /// Same layout for optional fields
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            t: &Option<DateTime<Utc>>,
            s: S,
        ) -> std::result::Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.serialize_some(&format_op_time(t)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| parse_op_time(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
