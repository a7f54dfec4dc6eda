//! Snapshot Acquisition

use obd_protocol::{ObdError, QueryMode, Reading, SensorId, SensorSnapshot, TelemetrySource};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Query every sensor once and assemble a snapshot.
///
/// A failing sensor is recorded as unavailable and does not abort the
/// acquisition. The call fails only when the link itself is gone: the
/// source reports it is not live, or every sensor failed with a link error.
pub async fn acquire_snapshot(
    source: &dyn TelemetrySource,
    mode: QueryMode,
) -> Result<SensorSnapshot, ObdError> {
    if !source.is_live() {
        return Err(ObdError::ConnectionClosed);
    }

    let mut readings = BTreeMap::new();
    let mut link_failure = None;
    let mut link_failures = 0usize;

    for sensor in SensorId::ALL {
        let reading = match source.query(mode, sensor).await {
            Ok(Some(reading)) => reading,
            Ok(None) => {
                debug!("{} returned no data", sensor);
                Reading::Unavailable
            }
            Err(e) => {
                warn!("Reading {} failed: {}", sensor, e);
                metrics::counter!("obd_sensor_failures_total").increment(1);
                if e.is_link_error() {
                    link_failures += 1;
                    link_failure = Some(e);
                }
                Reading::Unavailable
            }
        };
        readings.insert(sensor, reading);
    }

    if link_failures == SensorId::ALL.len() {
        if let Some(e) = link_failure {
            return Err(e);
        }
    }

    Ok(SensorSnapshot::new(readings))
}
