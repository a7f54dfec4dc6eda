//! Telemetry Source Capability Interface

use crate::error::ObdError;
use crate::mode;
use crate::sensor::{Reading, SensorId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Which OBD service a parameter is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMode {
    /// Live values (mode 01)
    CurrentData,
    /// Values stored when the last fault was recorded (mode 02)
    FreezeFrame,
}

impl QueryMode {
    /// OBD service id
    pub fn service(&self) -> u8 {
        match self {
            QueryMode::CurrentData => mode::CURRENT_DATA,
            QueryMode::FreezeFrame => mode::FREEZE_FRAME,
        }
    }
}

/// A live handle to something that answers parameter queries.
///
/// Implemented by the ELM327 serial adapter and by the simulated vehicle.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Query one parameter. `Ok(None)` means the vehicle answered without data.
    async fn query(&self, mode: QueryMode, sensor: SensorId) -> Result<Option<Reading>, ObdError>;

    /// Whether the handle still has a working link
    fn is_live(&self) -> bool;

    /// Clear stored trouble codes on the vehicle (mode 04)
    async fn clear_codes(&self) -> Result<(), ObdError>;

    /// Release the underlying link
    async fn close(&self) -> Result<(), ObdError>;

    /// Human readable name of the link, e.g. `/dev/ttyUSB0`
    fn port_name(&self) -> String;
}

/// Opens telemetry source handles
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Open a handle against `target`, or discover one when `target` is `None`.
    /// The whole attempt is bounded by `timeout`.
    async fn open(
        &self,
        target: Option<&str>,
        timeout: Duration,
    ) -> Result<Arc<dyn TelemetrySource>, ObdError>;
}
