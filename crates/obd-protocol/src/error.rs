//! Telemetry Source Error Types

use thiserror::Error;

/// Errors that can occur while talking to a telemetry source
#[derive(Debug, Clone, Error)]
pub enum ObdError {
    /// Serial port connection error
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Timeout waiting for response
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// Invalid response from adapter
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Sensor identifier outside the supported vocabulary
    #[error("Unknown sensor identifier: {0}")]
    UnknownSensor(String),

    /// Adapter not responding
    #[error("OBD adapter not responding")]
    AdapterNotResponding,

    /// No adapter answered during port discovery
    #[error("No OBD adapter found")]
    NoAdapterFound,

    /// Vehicle not connected
    #[error("Vehicle ignition is off or not connected")]
    VehicleNotConnected,

    /// The handle has already been closed
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ObdError {
    /// Whether this error means the link itself is gone, as opposed to a
    /// single parameter failing to answer.
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            ObdError::SerialError(_)
                | ObdError::AdapterNotResponding
                | ObdError::VehicleNotConnected
                | ObdError::ConnectionClosed
        )
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}
