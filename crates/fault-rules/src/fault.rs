//! Fault Records and Deduplicated Fault Sets

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::hash_set::{HashSet, IntoIter};
use thiserror::Error;

/// Rejected trouble code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid trouble code '{0}': expected a letter P/B/C/U followed by four hex digits")]
pub struct InvalidCode(pub String);

/// A detected fault: trouble code plus human readable description.
///
/// Two records are equal iff both fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FaultRecord {
    code: String,
    description: String,
}

impl FaultRecord {
    /// Create a record, validating the code shape (e.g. `P0171`)
    pub fn new(code: &str, description: &str) -> Result<Self, InvalidCode> {
        if !Self::is_valid_code(code) {
            return Err(InvalidCode(code.to_string()));
        }
        Ok(Self {
            code: code.to_string(),
            description: description.to_string(),
        })
    }

    pub(crate) fn from_rule(code: &'static str, description: &'static str) -> Self {
        Self {
            code: code.to_string(),
            description: description.to_string(),
        }
    }

    /// Whether `code` is a five character trouble code such as `P0420`
    pub fn is_valid_code(code: &str) -> bool {
        let bytes = code.as_bytes();
        bytes.len() == 5
            && matches!(bytes[0], b'P' | b'B' | b'C' | b'U')
            && bytes[1..].iter().all(u8::is_ascii_hexdigit)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl Serialize for FaultRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.code, &self.description).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FaultRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (code, description) = <(String, String)>::deserialize(deserializer)?;
        FaultRecord::new(&code, &description).map_err(serde::de::Error::custom)
    }
}

/// Deduplicated collection of fault records, keyed by (code, description).
///
/// Iteration order is unspecified; use [`FaultSet::sorted`] when a stable
/// order is needed. Serialization always uses the sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultSet(HashSet<FaultRecord>);

impl FaultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; returns false if an identical record was present
    pub fn insert(&mut self, record: FaultRecord) -> bool {
        self.0.insert(record)
    }

    pub fn contains(&self, record: &FaultRecord) -> bool {
        self.0.contains(record)
    }

    /// Whether any record carries `code`
    pub fn contains_code(&self, code: &str) -> bool {
        self.0.iter().any(|r| r.code == code)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FaultRecord> {
        self.0.iter()
    }

    /// Records ordered by code, then description
    pub fn sorted(&self) -> Vec<FaultRecord> {
        let mut records: Vec<_> = self.0.iter().cloned().collect();
        records.sort();
        records
    }

    /// Sorted, deduplicated codes
    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.0.iter().map(|r| r.code.as_str()).collect();
        codes.sort_unstable();
        codes.dedup();
        codes
    }
}

impl FromIterator<FaultRecord> for FaultSet {
    fn from_iter<I: IntoIterator<Item = FaultRecord>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for FaultSet {
    type Item = FaultRecord;
    type IntoIter = IntoIter<FaultRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Serialize for FaultSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.sorted().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FaultSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Vec::<FaultRecord>::deserialize(deserializer)?
            .into_iter()
            .collect())
    }
}
