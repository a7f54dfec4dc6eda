//! OBD-II Telemetry Source
//!
//! Defines the fixed sensor vocabulary, raw readings and immutable snapshots,
//! and the [`TelemetrySource`] capability interface that the rest of the
//! diagnostic core depends on. Two adapters implement it: an ELM327 serial
//! adapter and a simulated vehicle.

mod elm327;
mod error;
mod protocol;
mod sensor;
mod simulated;
mod snapshot;
mod source;

pub use elm327::{Elm327Config, Elm327Connector, Elm327Source};
pub use error::ObdError;
pub use protocol::ObdProtocol;
pub use sensor::{split_leading_number, Reading, SensorId, UNAVAILABLE};
pub use simulated::{SimulatedConnector, SimulatedSource};
pub use snapshot::SensorSnapshot;
pub use source::{QueryMode, SourceConnector, TelemetrySource};

/// OBD-II service (mode) constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Offset added to the service id in positive responses
    pub const RESPONSE_OFFSET: u8 = 0x40;
}
