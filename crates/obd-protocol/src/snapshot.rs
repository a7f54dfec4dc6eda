//! Immutable Sensor Snapshots

use crate::sensor::{Reading, SensorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// One complete acquisition of the sensor vocabulary.
///
/// A snapshot is never mutated after construction; a new poll produces a new
/// snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    readings: BTreeMap<SensorId, Reading>,
    captured_at: DateTime<Utc>,
}

impl SensorSnapshot {
    /// Build a snapshot captured now
    pub fn new(readings: BTreeMap<SensorId, Reading>) -> Self {
        Self {
            readings,
            captured_at: Utc::now(),
        }
    }

    /// Build a snapshot from raw display strings, e.g. `("MAF", "0.2")`
    pub fn from_raw<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (SensorId, S)>,
        S: AsRef<str>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(id, raw)| (id, Reading::parse(raw.as_ref())))
                .collect(),
        )
    }

    /// Reading for a sensor, if it was part of the acquisition
    pub fn get(&self, sensor: SensorId) -> Option<&Reading> {
        self.readings.get(&sensor)
    }

    /// Display string for a sensor, if present
    pub fn raw(&self, sensor: SensorId) -> Option<String> {
        self.readings.get(&sensor).map(Reading::to_string)
    }

    /// Iterate over readings in identifier order
    pub fn iter(&self) -> impl Iterator<Item = (SensorId, &Reading)> {
        self.readings.iter().map(|(id, r)| (*id, r))
    }

    /// Number of identifiers present
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Whether no identifier is present
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Number of identifiers recorded as unavailable
    pub fn unavailable_count(&self) -> usize {
        self.readings.values().filter(|r| !r.is_available()).count()
    }

    /// Time the acquisition finished
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Mapping of wire name to display string
    pub fn to_raw_map(&self) -> BTreeMap<String, String> {
        self.readings
            .iter()
            .map(|(id, r)| (id.as_str().to_string(), r.to_string()))
            .collect()
    }
}

impl Serialize for SensorSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.readings.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SensorSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let readings = BTreeMap::<SensorId, Reading>::deserialize(deserializer)?;
        Ok(Self::new(readings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw() {
        let snapshot = SensorSnapshot::from_raw([
            (SensorId::Rpm, "750"),
            (SensorId::Maf, "N/A"),
        ]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(SensorId::Rpm).and_then(Reading::value), Some(750.0));
        assert_eq!(snapshot.unavailable_count(), 1);
        assert!(snapshot.get(SensorId::Speed).is_none());
    }

    #[test]
    fn test_serializes_as_flat_map() {
        let snapshot = SensorSnapshot::from_raw([
            (SensorId::CoolantTemp, "90 degC"),
            (SensorId::Rpm, "800"),
        ]);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["COOLANT_TEMP"], "90 degC");
        assert_eq!(json["RPM"], "800");

        let back: SensorSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.raw(SensorId::CoolantTemp).as_deref(), Some("90 degC"));
    }
}
