//! Fault Rule Engine
//!
//! Pure, threshold-based detection of diagnostic trouble codes from a sensor
//! snapshot. No I/O and no state: the same snapshot always yields the same
//! fault set.

mod coerce;
mod fault;
mod rules;

pub use coerce::coerce;
pub use fault::{FaultRecord, FaultSet, InvalidCode};
pub use rules::{evaluate, rule_table, Rule, SensorValues};
