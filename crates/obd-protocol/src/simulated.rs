//! Simulated Vehicle
//!
//! A [`TelemetrySource`] that needs no hardware. By default it produces
//! plausible, slowly varying engine values; tests can script exact readings,
//! make single sensors fail, or drop the link.

use crate::error::ObdError;
use crate::sensor::{Reading, SensorId};
use crate::source::{QueryMode, SourceConnector, TelemetrySource};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// How unscripted sensors answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Profile {
    /// Pseudo-random values in realistic ranges
    Engine,
    /// Every sensor answers the index of the acquisition cycle it belongs to
    CycleCounter,
}

#[derive(Debug, Default)]
struct Script {
    readings: HashMap<SensorId, Option<Reading>>,
    failing: HashSet<SensorId>,
}

/// Simulated telemetry source
pub struct SimulatedSource {
    name: String,
    profile: Profile,
    script: Mutex<Script>,
    live: AtomicBool,
    vehicle_silent: AtomicBool,
    fail_close: AtomicBool,
    query_delay_ms: AtomicU64,
    queries: AtomicU64,
    clears: AtomicUsize,
    closes: AtomicUsize,
}

impl SimulatedSource {
    fn with_profile(profile: Profile) -> Self {
        Self {
            name: "simulated".to_string(),
            profile,
            script: Mutex::new(Script::default()),
            live: AtomicBool::new(true),
            vehicle_silent: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            query_delay_ms: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            clears: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    /// Source answering plausible engine values
    pub fn new() -> Self {
        Self::with_profile(Profile::Engine)
    }

    /// Source whose every reading equals the acquisition cycle number.
    ///
    /// Cycle `n` covers queries `n * 12 .. (n + 1) * 12`, so a snapshot
    /// acquired in one pass carries the same value for all twelve sensors.
    pub fn cycle_counter() -> Self {
        Self::with_profile(Profile::CycleCounter)
    }

    /// Source answering fixed display strings for the given sensors
    pub fn with_readings<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (SensorId, S)>,
        S: AsRef<str>,
    {
        let source = Self::new();
        for (id, raw) in pairs {
            source.set_reading(id, Some(Reading::parse(raw.as_ref())));
        }
        source
    }

    /// Script a sensor's answer; `None` answers "no data"
    pub fn set_reading(&self, sensor: SensorId, reading: Option<Reading>) {
        if let Ok(mut script) = self.script.lock() {
            script.readings.insert(sensor, reading);
        }
    }

    /// Make one sensor fail every query
    pub fn fail_sensor(&self, sensor: SensorId) {
        if let Ok(mut script) = self.script.lock() {
            script.failing.insert(sensor);
        }
    }

    /// Drop the link: every query fails and `is_live` reports false
    pub fn lose_link(&self) {
        info!("Simulated link lost");
        self.live.store(false, Ordering::SeqCst);
    }

    /// Keep the adapter link up but stop the vehicle answering, as with the
    /// ignition off. Queries fail with a link error while `is_live` stays true.
    pub fn silence_vehicle(&self, silent: bool) {
        self.vehicle_silent.store(silent, Ordering::SeqCst);
    }

    /// Make `close` fail
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Delay every query, e.g. to widen race windows in tests
    pub fn set_query_delay(&self, delay: Duration) {
        self.query_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of queries answered or failed so far
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of successful clear requests
    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    /// Number of successful closes
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn generate(&self, sensor: SensorId, index: u64) -> Reading {
        let cycle = index / SensorId::ALL.len() as u64;
        if self.profile == Profile::CycleCounter {
            return Reading::unitless(cycle as f64);
        }

        let mut hasher = DefaultHasher::new();
        cycle.hash(&mut hasher);
        sensor.hash(&mut hasher);
        let hash = hasher.finish();
        let jitter = |span: u64| (hash % span) as f64;

        let value = match sensor {
            // 750-3500 rpm
            SensorId::Rpm => 750.0 + jitter(2750),
            SensorId::Speed => jitter(120),
            // 85-100 degC
            SensorId::CoolantTemp => 85.0 + jitter(15),
            SensorId::IntakeTemp => 20.0 + jitter(15),
            // 2.0-20.0 g/s
            SensorId::Maf => 2.0 + jitter(1800) / 100.0,
            SensorId::ThrottlePos => 10.0 + jitter(40),
            // -5% to +5%
            SensorId::ShortFuelTrim1 | SensorId::LongFuelTrim1 => jitter(100) / 10.0 - 5.0,
            SensorId::O2B1S1 => 0.1 + jitter(80) / 100.0,
            SensorId::O2B1S2 => 0.2 + jitter(40) / 100.0,
            SensorId::TimingAdvance => 10.0 + jitter(20),
            SensorId::FuelPressure => 300.0 + jitter(100),
        };
        sensor.reading(value)
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for SimulatedSource {
    async fn query(&self, _mode: QueryMode, sensor: SensorId) -> Result<Option<Reading>, ObdError> {
        let index = self.queries.fetch_add(1, Ordering::SeqCst);

        let delay = self.query_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if !self.is_live() || self.vehicle_silent.load(Ordering::SeqCst) {
            return Err(ObdError::VehicleNotConnected);
        }

        let scripted = {
            let script = self
                .script
                .lock()
                .map_err(|e| ObdError::InvalidResponse(format!("Lock error: {}", e)))?;
            if script.failing.contains(&sensor) {
                return Err(ObdError::Timeout(0));
            }
            script.readings.get(&sensor).cloned()
        };

        debug!("Simulated query {} (#{})", sensor, index);
        match scripted {
            Some(reading) => Ok(reading),
            None => Ok(Some(self.generate(sensor, index))),
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn clear_codes(&self) -> Result<(), ObdError> {
        if !self.is_live() {
            return Err(ObdError::VehicleNotConnected);
        }
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), ObdError> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(ObdError::SerialError("simulated close failure".to_string()));
        }
        self.live.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn port_name(&self) -> String {
        self.name.clone()
    }
}

/// Connector handing out simulated sources
pub struct SimulatedConnector {
    /// Source returned by every open; a fresh one is made when `None`
    shared: Option<Arc<SimulatedSource>>,
    refuse: AtomicBool,
    open_delay: Duration,
    opens: AtomicUsize,
}

impl SimulatedConnector {
    /// Each open creates a fresh simulated vehicle
    pub fn new() -> Self {
        Self {
            shared: None,
            refuse: AtomicBool::new(false),
            open_delay: Duration::ZERO,
            opens: AtomicUsize::new(0),
        }
    }

    /// Every open returns the same source, so tests can drive it
    pub fn with_source(source: Arc<SimulatedSource>) -> Self {
        Self {
            shared: Some(source),
            ..Self::new()
        }
    }

    /// Slow down opens, e.g. to widen connect races in tests
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Make subsequent opens fail as if no adapter was present
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of handles opened so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceConnector for SimulatedConnector {
    async fn open(
        &self,
        _target: Option<&str>,
        timeout: Duration,
    ) -> Result<Arc<dyn TelemetrySource>, ObdError> {
        if !self.open_delay.is_zero() {
            if self.open_delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(ObdError::Timeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(self.open_delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ObdError::NoAdapterFound);
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let source: Arc<dyn TelemetrySource> = match &self.shared {
            Some(shared) => shared.clone(),
            None => Arc::new(SimulatedSource::new()),
        };
        info!("Opened simulated telemetry source");
        Ok(source)
    }
}
