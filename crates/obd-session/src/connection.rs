//! Connection Manager
//!
//! Owns the one process-wide handle to the telemetry source. Connect and
//! disconnect run inside a single critical section on the stored handle, so
//! racing callers can neither open two handles nor close one twice.

use crate::poller::TelemetryPoller;
use obd_protocol::{ObdError, SourceConnector, TelemetrySource};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where and how long to look for the telemetry source
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Explicit port; `None` lets the connector discover one
    pub target: Option<String>,
    /// Bound on a single open attempt
    pub timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            target: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Result of a connect request. Failures are reported here, never raised.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectOutcome {
    pub connected: bool,
    pub already_connected: bool,
    pub port: Option<String>,
    pub error: Option<String>,
}

/// Result of a disconnect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Disconnected,
    NotConnected,
}

/// Serialized owner of the telemetry source handle
pub struct ConnectionManager {
    connector: Arc<dyn SourceConnector>,
    poller: Arc<TelemetryPoller>,
    settings: ConnectionSettings,
    handle: Mutex<Option<Arc<dyn TelemetrySource>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        poller: Arc<TelemetryPoller>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            connector,
            poller,
            settings,
            handle: Mutex::new(None),
        }
    }

    /// Connect using the configured target
    pub async fn connect(&self) -> ConnectOutcome {
        let target = self.settings.target.clone();
        self.connect_to(target.as_deref()).await
    }

    /// Connect to `target`, or discover a source when `None`.
    ///
    /// Reuses a live handle instead of opening a second one.
    pub async fn connect_to(&self, target: Option<&str>) -> ConnectOutcome {
        let mut handle = self.handle.lock().await;

        if let Some(existing) = handle.as_ref() {
            if existing.is_live() {
                debug!("Connect requested while already connected");
                return ConnectOutcome {
                    connected: true,
                    already_connected: true,
                    port: Some(existing.port_name()),
                    error: None,
                };
            }
            warn!("Stored handle on {} is no longer live, reopening", existing.port_name());
            if let Err(e) = existing.close().await {
                debug!("Closing dead handle failed: {}", e);
            }
            *handle = None;
        }

        info!(target = target.unwrap_or("auto"), "Connecting to telemetry source");
        let timeout = self.settings.timeout;
        let opened = tokio::time::timeout(timeout, self.connector.open(target, timeout))
            .await
            .unwrap_or(Err(ObdError::Timeout(timeout.as_millis() as u64)));

        match opened {
            Ok(source) => {
                let port = source.port_name();
                info!("Connected to telemetry source on {}", port);
                *handle = Some(source);
                ConnectOutcome {
                    connected: true,
                    already_connected: false,
                    port: Some(port),
                    error: None,
                }
            }
            Err(e) => {
                warn!("Connection to telemetry source failed: {}", e);
                ConnectOutcome {
                    error: Some(e.to_string()),
                    ..ConnectOutcome::default()
                }
            }
        }
    }

    /// Stop polling, then close and clear the handle.
    ///
    /// The handle is cleared even when closing it fails; the close error is
    /// returned so the caller can report it.
    pub async fn disconnect(&self) -> Result<DisconnectOutcome, ObdError> {
        // Non-blocking; a stuck loop cannot hold up the disconnect.
        self.poller.stop();

        let mut handle = self.handle.lock().await;
        let Some(source) = handle.take() else {
            debug!("Disconnect requested with no active handle");
            return Ok(DisconnectOutcome::NotConnected);
        };

        let port = source.port_name();
        match source.close().await {
            Ok(()) => {
                info!("Disconnected from telemetry source on {}", port);
                Ok(DisconnectOutcome::Disconnected)
            }
            Err(e) => {
                warn!("Closing telemetry source on {} failed: {}", port, e);
                Err(e)
            }
        }
    }

    /// The stored handle, if any
    pub async fn current_handle(&self) -> Option<Arc<dyn TelemetrySource>> {
        self.handle.lock().await.clone()
    }

    /// Whether a live handle is stored
    pub async fn is_connected(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| h.is_live())
    }

    pub fn poller(&self) -> &Arc<TelemetryPoller> {
        &self.poller
    }
}
