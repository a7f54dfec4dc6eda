//! Threshold Rule Table

use crate::coerce::coerce;
use crate::fault::{FaultRecord, FaultSet};
use obd_protocol::{SensorId, SensorSnapshot};
use tracing::debug;

/// Coerced numeric view of a snapshot. Missing or malformed readings are `0.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorValues {
    pub rpm: f64,
    pub speed: f64,
    pub coolant: f64,
    pub intake: f64,
    pub maf: f64,
    pub throttle: f64,
    pub stft: f64,
    pub ltft: f64,
    pub o2s1: f64,
    pub o2s2: f64,
    pub timing: f64,
    pub fuel_pressure: f64,
}

impl SensorValues {
    pub fn from_snapshot(snapshot: &SensorSnapshot) -> Self {
        let value = |id: SensorId| coerce(snapshot.raw(id).as_deref());
        Self {
            rpm: value(SensorId::Rpm),
            speed: value(SensorId::Speed),
            coolant: value(SensorId::CoolantTemp),
            intake: value(SensorId::IntakeTemp),
            maf: value(SensorId::Maf),
            throttle: value(SensorId::ThrottlePos),
            stft: value(SensorId::ShortFuelTrim1),
            ltft: value(SensorId::LongFuelTrim1),
            o2s1: value(SensorId::O2B1S1),
            o2s2: value(SensorId::O2B1S2),
            timing: value(SensorId::TimingAdvance),
            fuel_pressure: value(SensorId::FuelPressure),
        }
    }
}

/// One threshold rule. Rules are independent and side-effect free.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub code: &'static str,
    pub description: &'static str,
    pub condition: fn(&SensorValues) -> bool,
}

impl Rule {
    pub fn fires(&self, values: &SensorValues) -> bool {
        (self.condition)(values)
    }

    pub fn record(&self) -> FaultRecord {
        FaultRecord::from_rule(self.code, self.description)
    }
}

// Fuel mixture and airflow

fn system_too_lean(v: &SensorValues) -> bool {
    v.maf < 0.6 && v.ltft > 10.0 && v.stft > 8.0
}

fn system_too_rich(v: &SensorValues) -> bool {
    v.maf > 3.5 && v.ltft < -10.0 && v.stft < -8.0
}

fn maf_out_of_range(v: &SensorValues) -> bool {
    v.maf < 0.3 || v.maf > 10.0
}

// Misfire and ignition

fn random_misfire(v: &SensorValues) -> bool {
    v.rpm < 600.0 && v.throttle < 5.0 && v.timing < 10.0
}

fn cylinder1_misfire(v: &SensorValues) -> bool {
    v.stft.abs() > 15.0 && v.rpm < 650.0
}

// Catalyst and oxygen sensors

fn catalyst_efficiency(v: &SensorValues) -> bool {
    (v.o2s1 - v.o2s2).abs() < 0.1 && v.o2s2 > 0.6
}

fn o2_slow_response(v: &SensorValues) -> bool {
    v.stft.abs() > 12.0 && (v.o2s1 < 0.2 || v.o2s1 > 0.9)
}

// Cooling

fn thermostat_below_regulating(v: &SensorValues) -> bool {
    v.coolant < 70.0 && v.speed > 20.0
}

fn engine_over_temperature(v: &SensorValues) -> bool {
    v.coolant > 105.0
}

// Fuel pressure, throttle, idle, intake air

fn fuel_pressure_low(v: &SensorValues) -> bool {
    v.fuel_pressure < 35.0 && (v.maf < 1.5 || v.ltft > 12.0)
}

fn throttle_body_range(v: &SensorValues) -> bool {
    v.throttle < 5.0 && v.rpm > 2500.0
}

fn idle_rpm_high(v: &SensorValues) -> bool {
    v.rpm > 600.0 && v.rpm < 900.0 && v.stft.abs() > 10.0 && v.maf < 0.5
}

fn intake_air_temp_range(v: &SensorValues) -> bool {
    v.intake < -10.0 || v.intake > 60.0
}

static RULES: [Rule; 13] = [
    Rule {
        code: "P0171",
        description: "System Too Lean Bank 1",
        condition: system_too_lean,
    },
    Rule {
        code: "P0172",
        description: "System Too Rich (Bank 1)",
        condition: system_too_rich,
    },
    Rule {
        code: "P0101",
        description: "MAF Circuit Range/Performance",
        condition: maf_out_of_range,
    },
    Rule {
        code: "P0300",
        description: "Random Misfire Detected Code",
        condition: random_misfire,
    },
    Rule {
        code: "P0301",
        description: "Cylinder #1 Misfire",
        condition: cylinder1_misfire,
    },
    Rule {
        code: "P0420",
        description: "Catalyst System Efficiency Below Threshold",
        condition: catalyst_efficiency,
    },
    Rule {
        code: "P0133",
        description: "Oxygen Sensor Circuit Slow Response",
        condition: o2_slow_response,
    },
    Rule {
        code: "P0128",
        description: "Thermostat OBD-II Trouble Code",
        condition: thermostat_below_regulating,
    },
    Rule {
        code: "P0217",
        description: "Engine Over Temperature",
        condition: engine_over_temperature,
    },
    Rule {
        code: "P0087",
        description: "Fuel Rail/System Pressure - Too Low",
        condition: fuel_pressure_low,
    },
    Rule {
        code: "P2119",
        description: "Throttle Actuator Control Throttle Body Range",
        condition: throttle_body_range,
    },
    Rule {
        code: "P0507",
        description: "Idle Air Control System RPM Higher Than Expected",
        condition: idle_rpm_high,
    },
    Rule {
        code: "P0113",
        description: "IAT Sensor 1 Circuit High Input",
        condition: intake_air_temp_range,
    },
];

/// The full rule table
pub fn rule_table() -> &'static [Rule] {
    &RULES
}

/// Evaluate every rule against one snapshot
pub fn evaluate(snapshot: &SensorSnapshot) -> FaultSet {
    let values = SensorValues::from_snapshot(snapshot);
    let faults: FaultSet = RULES
        .iter()
        .filter(|rule| rule.fires(&values))
        .map(Rule::record)
        .collect();

    debug!(
        sensors = snapshot.len(),
        faults = faults.len(),
        "Evaluated fault rules"
    );
    faults
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(pairs: &[(SensorId, &str)]) -> SensorSnapshot {
        SensorSnapshot::from_raw(pairs.iter().copied())
    }

    /// Readings that trip no rule
    fn healthy() -> Vec<(SensorId, &'static str)> {
        vec![
            (SensorId::Rpm, "800"),
            (SensorId::Speed, "0"),
            (SensorId::CoolantTemp, "90"),
            (SensorId::IntakeTemp, "25"),
            (SensorId::Maf, "3.0"),
            (SensorId::ThrottlePos, "15"),
            (SensorId::ShortFuelTrim1, "1"),
            (SensorId::LongFuelTrim1, "2"),
            (SensorId::O2B1S1, "0.45"),
            (SensorId::O2B1S2, "0.3"),
            (SensorId::TimingAdvance, "12"),
            (SensorId::FuelPressure, "300"),
        ]
    }

    fn with(overrides: &[(SensorId, &'static str)]) -> SensorSnapshot {
        let mut pairs = healthy();
        for (id, raw) in overrides {
            if let Some(entry) = pairs.iter_mut().find(|(k, _)| k == id) {
                entry.1 = *raw;
            }
        }
        snapshot(&pairs)
    }

    #[test]
    fn test_healthy_engine_has_no_faults() {
        assert!(evaluate(&with(&[])).is_empty());
    }

    #[test]
    fn test_lean_condition() {
        let faults = evaluate(&with(&[
            (SensorId::Maf, "0.2"),
            (SensorId::LongFuelTrim1, "15"),
            (SensorId::ShortFuelTrim1, "10"),
        ]));
        assert!(faults.contains_code("P0171"));
        assert!(faults.contains_code("P0101"));
        assert!(!faults.contains_code("P0172"));
    }

    #[test]
    fn test_rich_condition() {
        let faults = evaluate(&with(&[
            (SensorId::Maf, "4.0"),
            (SensorId::LongFuelTrim1, "-11"),
            (SensorId::ShortFuelTrim1, "-9"),
        ]));
        assert_eq!(faults.codes(), vec!["P0172"]);
    }

    #[test]
    fn test_overheating() {
        let faults = evaluate(&with(&[(SensorId::CoolantTemp, "110 degC")]));
        assert!(faults.contains_code("P0217"));
    }

    #[test]
    fn test_overheating_with_unit_glued_to_value() {
        let faults = evaluate(&with(&[(SensorId::CoolantTemp, "110C")]));
        assert!(faults.contains_code("P0217"));

        let values = SensorValues::from_snapshot(&with(&[(SensorId::CoolantTemp, "110C")]));
        assert_eq!(values.coolant, 110.0);
    }

    #[test]
    fn test_cold_thermostat_while_moving() {
        let faults = evaluate(&with(&[(SensorId::CoolantTemp, "60"), (SensorId::Speed, "50")]));
        assert_eq!(faults.codes(), vec!["P0128"]);
    }

    #[test]
    fn test_idle_and_throttle_rules() {
        let idle = evaluate(&with(&[
            (SensorId::Rpm, "750"),
            (SensorId::ShortFuelTrim1, "11"),
            (SensorId::Maf, "0.4"),
        ]));
        assert!(idle.contains_code("P0507"));

        let limp = evaluate(&with(&[(SensorId::ThrottlePos, "2"), (SensorId::Rpm, "3000")]));
        assert!(limp.contains_code("P2119"));
    }

    #[test]
    fn test_catalyst_and_intake_air() {
        let faults = evaluate(&with(&[(SensorId::O2B1S1, "0.7"), (SensorId::O2B1S2, "0.65")]));
        assert_eq!(faults.codes(), vec!["P0420"]);

        let faults = evaluate(&with(&[(SensorId::IntakeTemp, "-20")]));
        assert_eq!(faults.codes(), vec!["P0113"]);
    }

    #[test]
    fn test_freeze_frame_scenario() {
        let faults = evaluate(&snapshot(&[
            (SensorId::Rpm, "300"),
            (SensorId::Speed, "0"),
            (SensorId::CoolantTemp, "90"),
            (SensorId::IntakeTemp, "20"),
            (SensorId::Maf, "0.2"),
            (SensorId::ThrottlePos, "2"),
            (SensorId::ShortFuelTrim1, "9"),
            (SensorId::LongFuelTrim1, "11"),
            (SensorId::O2B1S1, "0.5"),
            (SensorId::O2B1S2, "0.5"),
            (SensorId::TimingAdvance, "5"),
            (SensorId::FuelPressure, "40"),
        ]));
        assert_eq!(faults.codes(), vec!["P0101", "P0171", "P0300"]);
    }

    #[test]
    fn test_missing_and_unavailable_coerce_to_zero() {
        // Everything zero: MAF below range, misfire at 0 rpm, fuel pressure low
        let faults = evaluate(&snapshot(&[(SensorId::Rpm, "N/A")]));
        assert_eq!(faults.codes(), vec!["P0087", "P0101", "P0300"]);
    }

    #[test]
    fn test_rule_codes_are_valid() {
        for rule in rule_table() {
            assert!(FaultRecord::is_valid_code(rule.code), "{}", rule.code);
        }
        assert_eq!(rule_table().len(), 13);
    }

    proptest! {
        #[test]
        fn prop_overheating_always_reported(
            rpm in -1000.0f64..9000.0,
            maf in 0.0f64..50.0,
            stft in -30.0f64..30.0,
            coolant in 105.01f64..200.0,
        ) {
            let snap = SensorSnapshot::from_raw([
                (SensorId::Rpm, rpm.to_string()),
                (SensorId::Maf, maf.to_string()),
                (SensorId::ShortFuelTrim1, stft.to_string()),
                (SensorId::CoolantTemp, coolant.to_string()),
            ]);
            prop_assert!(evaluate(&snap).contains_code("P0217"));
        }

        #[test]
        fn prop_deterministic(raw in proptest::collection::vec(".{0,12}", 12)) {
            let snap = SensorSnapshot::from_raw(SensorId::ALL.iter().copied().zip(raw));
            prop_assert_eq!(evaluate(&snap), evaluate(&snap));
        }
    }
}
