//! Sensor Vocabulary and Raw Readings
//!
//! Defines the twelve Mode 01/02 parameters the diagnostic core reads and
//! their SAE J1979 decoding formulas.

use crate::error::ObdError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Marker stored in place of a reading the source could not provide
pub const UNAVAILABLE: &str = "N/A";

/// Sensor identifiers understood by the telemetry core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorId {
    /// Engine RPM (0x0C)
    #[serde(rename = "RPM")]
    Rpm,
    /// Vehicle speed (0x0D)
    #[serde(rename = "SPEED")]
    Speed,
    /// Engine coolant temperature (0x05)
    #[serde(rename = "COOLANT_TEMP")]
    CoolantTemp,
    /// Intake air temperature (0x0F)
    #[serde(rename = "INTAKE_TEMP")]
    IntakeTemp,
    /// Mass air flow rate (0x10)
    #[serde(rename = "MAF")]
    Maf,
    /// Throttle position (0x11)
    #[serde(rename = "THROTTLE_POS")]
    ThrottlePos,
    /// Short-term fuel trim bank 1 (0x06)
    #[serde(rename = "SHORT_FUEL_TRIM_1")]
    ShortFuelTrim1,
    /// Long-term fuel trim bank 1 (0x07)
    #[serde(rename = "LONG_FUEL_TRIM_1")]
    LongFuelTrim1,
    /// Oxygen sensor bank 1, sensor 1 (0x14)
    #[serde(rename = "O2_B1S1")]
    O2B1S1,
    /// Oxygen sensor bank 1, sensor 2 (0x15)
    #[serde(rename = "O2_B1S2")]
    O2B1S2,
    /// Ignition timing advance (0x0E)
    #[serde(rename = "TIMING_ADVANCE")]
    TimingAdvance,
    /// Fuel pressure (0x0A)
    #[serde(rename = "FUEL_PRESSURE")]
    FuelPressure,
}

impl SensorId {
    /// Every identifier, in acquisition order
    pub const ALL: [SensorId; 12] = [
        SensorId::Rpm,
        SensorId::Speed,
        SensorId::CoolantTemp,
        SensorId::IntakeTemp,
        SensorId::Maf,
        SensorId::ThrottlePos,
        SensorId::ShortFuelTrim1,
        SensorId::LongFuelTrim1,
        SensorId::O2B1S1,
        SensorId::O2B1S2,
        SensorId::TimingAdvance,
        SensorId::FuelPressure,
    ];

    /// Wire name used in snapshots and HTTP bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorId::Rpm => "RPM",
            SensorId::Speed => "SPEED",
            SensorId::CoolantTemp => "COOLANT_TEMP",
            SensorId::IntakeTemp => "INTAKE_TEMP",
            SensorId::Maf => "MAF",
            SensorId::ThrottlePos => "THROTTLE_POS",
            SensorId::ShortFuelTrim1 => "SHORT_FUEL_TRIM_1",
            SensorId::LongFuelTrim1 => "LONG_FUEL_TRIM_1",
            SensorId::O2B1S1 => "O2_B1S1",
            SensorId::O2B1S2 => "O2_B1S2",
            SensorId::TimingAdvance => "TIMING_ADVANCE",
            SensorId::FuelPressure => "FUEL_PRESSURE",
        }
    }

    /// OBD-II parameter id
    pub fn pid(&self) -> u8 {
        match self {
            SensorId::Rpm => 0x0C,
            SensorId::Speed => 0x0D,
            SensorId::CoolantTemp => 0x05,
            SensorId::IntakeTemp => 0x0F,
            SensorId::Maf => 0x10,
            SensorId::ThrottlePos => 0x11,
            SensorId::ShortFuelTrim1 => 0x06,
            SensorId::LongFuelTrim1 => 0x07,
            SensorId::O2B1S1 => 0x14,
            SensorId::O2B1S2 => 0x15,
            SensorId::TimingAdvance => 0x0E,
            SensorId::FuelPressure => 0x0A,
        }
    }

    /// Unit token appended to decoded values
    pub fn unit(&self) -> &'static str {
        match self {
            SensorId::Rpm => "revolutions_per_minute",
            SensorId::Speed => "kph",
            SensorId::CoolantTemp | SensorId::IntakeTemp => "degC",
            SensorId::Maf => "gps",
            SensorId::ThrottlePos | SensorId::ShortFuelTrim1 | SensorId::LongFuelTrim1 => "percent",
            SensorId::O2B1S1 | SensorId::O2B1S2 => "volt",
            SensorId::TimingAdvance => "degree",
            SensorId::FuelPressure => "kilopascal",
        }
    }

    /// Number of data bytes carried by a response
    pub fn response_bytes(&self) -> usize {
        match self {
            SensorId::Rpm | SensorId::Maf | SensorId::O2B1S1 | SensorId::O2B1S2 => 2,
            _ => 1,
        }
    }

    /// Decode response data bytes into an engineering value
    pub fn decode(&self, bytes: &[u8]) -> Option<f64> {
        if bytes.len() < self.response_bytes() {
            return None;
        }
        let a = bytes[0] as f64;
        let value = match self {
            // ((A*256)+B)/4
            SensorId::Rpm => (a * 256.0 + bytes[1] as f64) / 4.0,
            SensorId::Speed => a,
            // A - 40
            SensorId::CoolantTemp | SensorId::IntakeTemp => a - 40.0,
            // ((A*256)+B) / 100
            SensorId::Maf => (a * 256.0 + bytes[1] as f64) / 100.0,
            SensorId::ThrottlePos => a * 100.0 / 255.0,
            // (A - 128) * 100 / 128
            SensorId::ShortFuelTrim1 | SensorId::LongFuelTrim1 => (a - 128.0) * 100.0 / 128.0,
            // A / 200, second byte is the trim
            SensorId::O2B1S1 | SensorId::O2B1S2 => a / 200.0,
            SensorId::TimingAdvance => a / 2.0 - 64.0,
            SensorId::FuelPressure => a * 3.0,
        };
        Some(value)
    }

    /// Build a reading for a decoded value, tagged with this sensor's unit
    pub fn reading(&self, value: f64) -> Reading {
        Reading::new(value, self.unit())
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorId {
    type Err = ObdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SensorId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ObdError::UnknownSensor(s.to_string()))
    }
}

/// A raw reading: a number with an optional unit token, or unavailable
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// Numeric value as answered by the source
    Value { value: f64, unit: Option<String> },
    /// The source had no value, or the query failed
    Unavailable,
}

impl Reading {
    /// Value with a unit token
    pub fn new(value: f64, unit: &str) -> Self {
        Reading::Value {
            value,
            unit: Some(unit.to_string()),
        }
    }

    /// Bare numeric value
    pub fn unitless(value: f64) -> Self {
        Reading::Value { value, unit: None }
    }

    /// Parse the display form back into a reading.
    ///
    /// The leading number is the value and whatever follows it, with or
    /// without a separating space, is the unit. Anything that does not start
    /// with a number is treated as unavailable.
    pub fn parse(raw: &str) -> Self {
        match split_leading_number(raw) {
            Some((value, rest)) => Reading::Value {
                value,
                unit: Some(rest).filter(|u| !u.is_empty()).map(str::to_string),
            },
            None => Reading::Unavailable,
        }
    }

    /// Numeric value, if available
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Value { value, .. } => Some(*value),
            Reading::Unavailable => None,
        }
    }

    /// Whether the reading carries a value
    pub fn is_available(&self) -> bool {
        matches!(self, Reading::Value { .. })
    }
}

/// Split text into its leading finite number and the trimmed remainder.
///
/// `"-12.3C"` yields `(-12.3, "C")` and `"123.4 kPa"` yields `(123.4, "kPa")`.
/// Returns `None` when the text does not start with a number.
pub fn split_leading_number(raw: &str) -> Option<(f64, &str)> {
    let raw = raw.trim();
    let end = numeric_prefix_len(raw);
    if end == 0 {
        return None;
    }
    let value = raw[..end].parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some((value, raw[end..].trim()))
}

/// Length of the longest prefix shaped like `[+-]digits[.digits][e[+-]digits]`
fn numeric_prefix_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut i = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        i = 1;
    }

    let int_end = digits_from(i);
    let mut mantissa_digits = int_end - i;
    i = int_end;

    if bytes.get(i) == Some(&b'.') {
        let frac_end = digits_from(i + 1);
        let frac_digits = frac_end - (i + 1);
        if mantissa_digits + frac_digits > 0 {
            mantissa_digits += frac_digits;
            i = frac_end;
        }
    }

    if mantissa_digits == 0 {
        return 0;
    }

    if matches!(bytes.get(i), Some(b'e') | Some(b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+') | Some(b'-')) {
            j += 1;
        }
        let exp_end = digits_from(j);
        if exp_end > j {
            i = exp_end;
        }
    }

    i
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Value { value, unit: Some(unit) } => write!(f, "{} {}", value, unit),
            Reading::Value { value, unit: None } => write!(f, "{}", value),
            Reading::Unavailable => f.write_str(UNAVAILABLE),
        }
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Reading {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Reading::parse(&raw))
    }
}
