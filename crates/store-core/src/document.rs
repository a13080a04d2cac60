//! Document: a JSON field map with store-stamped system timestamps.
//!
//! Documents live inside collections as `id -> Fields`. The store (never the
//! caller) stamps two system fields on every mutation:
//! - `createdAt`: set when the document first appears
//! - `updatedAt`: refreshed on every mutating operation
//!
//! Field maps use `IndexMap` so iteration order is insertion order, which the
//! query engine's limit semantics depend on.

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// System field: ISO timestamp of document creation.
pub const CREATED_AT: &str = "createdAt";
/// System field: ISO timestamp of the last mutation.
pub const UPDATED_AT: &str = "updatedAt";

/// Field map for a single document (field name -> JSON value).
pub type Fields = IndexMap<String, Value>;

/// A document snapshot: id plus its fields at the time of the read.
///
/// Snapshots are copies; later mutations of the store do not affect them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id, unique within its collection.
    pub id: String,
    /// Field values, including the stamped system fields.
    pub fields: Fields,
}

impl Document {
    /// Look up a field value by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// The stamped creation timestamp, if present.
    pub fn created_at(&self) -> Option<&str> {
        self.fields.get(CREATED_AT).and_then(Value::as_str)
    }

    /// The stamped last-update timestamp, if present.
    pub fn updated_at(&self) -> Option<&str> {
        self.fields.get(UPDATED_AT).and_then(Value::as_str)
    }
}

/// Current time as an ISO-8601 UTC timestamp with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// Generate a new document id.
///
/// The id is the current millisecond timestamp in base 36 plus a random
/// suffix. Unique within a collection for practical purposes, but carries no
/// ordering guarantee and must not be treated as sortable.
pub fn generate_id() -> String {
    use rand::Rng;

    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut id = to_base36(millis);
    let mut rng = rand::rng();
    for _ in 0..ID_SUFFIX_LEN {
        let n = rng.random_range(0..ID_ALPHABET.len());
        id.push(ID_ALPHABET[n] as char);
    }
    id
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(ID_ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_id_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_generate_id_alphabet() {
        let id = generate_id();
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(id.len() > ID_SUFFIX_LEN);
    }

    #[test]
    fn test_to_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1234567890), "kf12oi");
    }

    #[test]
    fn test_now_iso_format() {
        let ts = now_iso();
        // e.g. "2026-08-30T12:34:56.789Z"
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
