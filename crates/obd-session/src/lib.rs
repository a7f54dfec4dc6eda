//! OBD-II Telemetry Session
//!
//! Owns the single connection handle to the telemetry source and the
//! background polling loop that keeps the latest sensor snapshot fresh for
//! concurrent readers.

mod acquire;
mod connection;
mod poller;

pub use acquire::acquire_snapshot;
pub use connection::{ConnectOutcome, ConnectionManager, ConnectionSettings, DisconnectOutcome};
pub use poller::{PollerState, SessionInfo, StartOutcome, TelemetryPoller};
