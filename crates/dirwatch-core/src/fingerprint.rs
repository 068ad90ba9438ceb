//! Content fingerprints over snapshot attributes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::CompanyAttributes;

/// Length of the hex prefix used in log lines. Not collision-free; never
/// compare short forms.
pub const SHORT_LEN: usize = 16;

const UNSERIALIZABLE: &str = "<unserializable>";

/// Hex-encoded SHA-256 of a canonical attribute payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps a digest read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.get(..SHORT_LEN).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn field_value<T: Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or_else(|_| JsonValue::String(UNSERIALIZABLE.to_string()))
}

/// Fingerprint an arbitrary attribute set. Keys are sorted before hashing,
/// so iteration order does not matter.
pub fn fingerprint_fields<'a, I>(fields: I) -> Fingerprint
where
    I: IntoIterator<Item = (&'a str, JsonValue)>,
{
    let canonical: BTreeMap<&str, JsonValue> = fields.into_iter().collect();
    let payload =
        serde_json::to_string(&canonical).unwrap_or_else(|_| UNSERIALIZABLE.to_string());
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Fingerprint of the snapshot-tracked attributes. Tags hash as an ordered list.
pub fn fingerprint(attributes: &CompanyAttributes) -> Fingerprint {
    fingerprint_fields([
        ("batch", field_value(&attributes.batch)),
        ("stage", field_value(&attributes.stage)),
        ("description", field_value(&attributes.description)),
        ("location", field_value(&attributes.location)),
        ("tags", field_value(&attributes.tags)),
        ("employee_range", field_value(&attributes.employee_range)),
    ])
}
