//! Live Data Poller
//!
//! A background task repeatedly acquires a full snapshot and publishes it by
//! replacing the whole value in a watch channel. Readers clone the current
//! `Arc<SensorSnapshot>` and never observe a half-written snapshot.

use crate::acquire::acquire_snapshot;
use chrono::{DateTime, Utc};
use obd_protocol::{ObdError, QueryMode, SensorSnapshot, TelemetrySource};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{error, info};

/// Shortest accepted polling interval
const MIN_INTERVAL: Duration = Duration::from_millis(10);

type LatestSnapshot = Option<Arc<SensorSnapshot>>;

/// Lifecycle of the polling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    /// No loop is running
    Idle,
    /// Session created, loop not yet executing
    Starting,
    /// Loop is acquiring snapshots
    Running,
    /// Stop requested, loop has not exited yet
    Stopping,
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Serializable view of the current session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub state: PollerState,
    pub interval_secs: f64,
    pub started_at: DateTime<Utc>,
    pub cycles: u64,
}

/// One polling session, from start until its loop exits
struct PollingSession {
    id: u64,
    interval: Duration,
    started_at: DateTime<Utc>,
    active: AtomicBool,
    running: AtomicBool,
    finished: AtomicBool,
    cycles: AtomicU64,
    wake: Notify,
}

impl PollingSession {
    fn new(id: u64, interval: Duration) -> Self {
        Self {
            id,
            interval,
            started_at: Utc::now(),
            active: AtomicBool::new(true),
            running: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn state(&self) -> PollerState {
        let active = self.is_active();
        if self.finished.load(Ordering::SeqCst) {
            PollerState::Idle
        } else if active && self.running.load(Ordering::SeqCst) {
            PollerState::Running
        } else if active {
            PollerState::Starting
        } else {
            PollerState::Stopping
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            state: self.state(),
            interval_secs: self.interval.as_secs_f64(),
            started_at: self.started_at,
            cycles: self.cycles.load(Ordering::SeqCst),
        }
    }
}

/// Background live-data poller with a shared, lock-free-to-read cache
pub struct TelemetryPoller {
    session: Mutex<Option<Arc<PollingSession>>>,
    latest: Arc<watch::Sender<LatestSnapshot>>,
    next_id: AtomicU64,
}

impl TelemetryPoller {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            session: Mutex::new(None),
            latest: Arc::new(latest),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start polling `source` every `interval`. A no-op while a session is active.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, source: Arc<dyn TelemetrySource>, interval: Duration) -> StartOutcome {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|s| s.is_active()) {
            return StartOutcome::AlreadyRunning;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(PollingSession::new(id, interval.max(MIN_INTERVAL)));
        *slot = Some(session.clone());

        info!(
            session = id,
            interval_ms = session.interval.as_millis() as u64,
            "Starting live data polling"
        );
        tokio::spawn(run_loop(session, source, self.latest.clone()));
        StartOutcome::Started
    }

    /// Request the loop to stop. Returns immediately; the loop exits on its
    /// next wake. Returns false if no session was active.
    pub fn stop(&self) -> bool {
        let slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(session) if session.active.swap(false, Ordering::SeqCst) => {
                session.wake.notify_one();
                info!(session = session.id, "Live data polling stop requested");
                true
            }
            _ => false,
        }
    }

    /// Latest published snapshot. Never triggers an acquisition.
    pub fn get_latest(&self) -> Option<Arc<SensorSnapshot>> {
        self.latest.borrow().clone()
    }

    /// Receiver notified on every publication
    pub fn subscribe(&self) -> watch::Receiver<LatestSnapshot> {
        self.latest.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some_and(|s| s.is_active())
    }

    pub fn state(&self) -> PollerState {
        self.current().map_or(PollerState::Idle, |s| s.state())
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.current().map(|s| s.info())
    }

    /// One-shot acquisition outside the session, e.g. for freeze-frame reads
    pub async fn poll_once(
        &self,
        source: &dyn TelemetrySource,
        mode: QueryMode,
    ) -> Result<SensorSnapshot, ObdError> {
        acquire_snapshot(source, mode).await
    }

    fn current(&self) -> Option<Arc<PollingSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for TelemetryPoller {
    fn default() -> Self {
        Self::new()
    }
}

/// Ends the session however its loop exits, including a panic in the source
struct SessionExit {
    session: Arc<PollingSession>,
    clean: bool,
}

impl Drop for SessionExit {
    fn drop(&mut self) {
        let session = &self.session;
        if !self.clean {
            error!(session = session.id, "Live data polling task terminated abnormally");
        }
        session.active.store(false, Ordering::SeqCst);
        session.finished.store(true, Ordering::SeqCst);
        metrics::gauge!("obd_poller_active").set(0.0);
        info!(
            session = session.id,
            cycles = session.cycles.load(Ordering::SeqCst),
            "Live data polling ended"
        );
    }
}

async fn run_loop(
    session: Arc<PollingSession>,
    source: Arc<dyn TelemetrySource>,
    latest: Arc<watch::Sender<LatestSnapshot>>,
) {
    let mut exit = SessionExit {
        session: session.clone(),
        clean: false,
    };
    session.running.store(true, Ordering::SeqCst);
    metrics::gauge!("obd_poller_active").set(1.0);
    info!(session = session.id, "Live data polling started");

    while session.is_active() {
        match acquire_snapshot(source.as_ref(), QueryMode::CurrentData).await {
            Ok(snapshot) => {
                // A stop that arrived mid-acquisition wins over the publish.
                if !session.is_active() {
                    break;
                }
                latest.send_replace(Some(Arc::new(snapshot)));
                session.cycles.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("obd_poll_cycles_total").increment(1);
            }
            Err(e) => {
                error!(session = session.id, "Live data polling aborted: {}", e);
                session.active.store(false, Ordering::SeqCst);
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(session.interval) => {}
            _ = session.wake.notified() => {}
        }
    }

    exit.clean = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use obd_protocol::{Reading, SensorId, SimulatedSource};
    use std::time::Instant;

    /// Source whose query panics, as a decoder bug on a garbled reply would
    struct PanickingSource;

    #[async_trait]
    impl TelemetrySource for PanickingSource {
        async fn query(
            &self,
            _mode: QueryMode,
            _sensor: SensorId,
        ) -> Result<Option<Reading>, ObdError> {
            panic!("byte index 1 is not a char boundary");
        }

        fn is_live(&self) -> bool {
            true
        }

        async fn clear_codes(&self) -> Result<(), ObdError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), ObdError> {
            Ok(())
        }

        fn port_name(&self) -> String {
            "panicking".to_string()
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_start_publishes_snapshots() {
        let poller = TelemetryPoller::new();
        assert_eq!(poller.state(), PollerState::Idle);
        assert!(poller.get_latest().is_none());

        let source = Arc::new(SimulatedSource::new());
        assert_eq!(
            poller.start(source.clone(), Duration::from_millis(20)),
            StartOutcome::Started
        );
        assert!(poller.is_active());

        wait_for(|| poller.get_latest().is_some()).await;
        assert_eq!(poller.state(), PollerState::Running);
        let snapshot = poller.get_latest().unwrap();
        assert_eq!(snapshot.len(), SensorId::ALL.len());

        poller.stop();
        wait_for(|| poller.state() == PollerState::Idle).await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let poller = TelemetryPoller::new();
        let source = Arc::new(SimulatedSource::new());
        assert_eq!(
            poller.start(source.clone(), Duration::from_millis(20)),
            StartOutcome::Started
        );
        assert_eq!(
            poller.start(source.clone(), Duration::from_millis(20)),
            StartOutcome::AlreadyRunning
        );
        assert_eq!(poller.session_info().map(|i| i.id), Some(1));
        poller.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_non_blocking() {
        let poller = TelemetryPoller::new();
        assert!(!poller.stop());

        let source = Arc::new(SimulatedSource::new());
        poller.start(source, Duration::from_secs(3600));
        wait_for(|| poller.get_latest().is_some()).await;

        let began = Instant::now();
        assert!(poller.stop());
        assert!(!poller.stop());
        assert!(began.elapsed() < Duration::from_millis(100));

        // The wake notification cuts the hour-long sleep short.
        wait_for(|| poller.state() == PollerState::Idle).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_mixed_snapshots() {
        let poller = Arc::new(TelemetryPoller::new());
        let source = Arc::new(SimulatedSource::cycle_counter());
        poller.start(source, Duration::from_millis(10));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let poller = poller.clone();
            readers.push(tokio::spawn(async move {
                let mut seen = 0;
                let deadline = Instant::now() + Duration::from_millis(300);
                while Instant::now() < deadline {
                    if let Some(snapshot) = poller.get_latest() {
                        let values: Vec<f64> =
                            snapshot.iter().filter_map(|(_, r)| r.value()).collect();
                        assert_eq!(values.len(), SensorId::ALL.len());
                        assert!(
                            values.iter().all(|v| *v == values[0]),
                            "torn snapshot: {:?}",
                            values
                        );
                        seen += 1;
                    }
                    tokio::task::yield_now().await;
                }
                seen
            }));
        }

        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
        poller.stop();
    }

    #[tokio::test]
    async fn test_cache_stops_changing_after_stop() {
        let interval = Duration::from_millis(50);
        let poller = TelemetryPoller::new();
        poller.start(Arc::new(SimulatedSource::new()), interval);
        wait_for(|| poller.session_info().is_some_and(|i| i.cycles >= 2)).await;

        poller.stop();
        tokio::time::sleep(interval * 2).await;
        let frozen = poller.get_latest().unwrap();
        tokio::time::sleep(interval * 4).await;
        let later = poller.get_latest().unwrap();

        assert!(Arc::ptr_eq(&frozen, &later));
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[tokio::test]
    async fn test_lost_link_ends_session_but_keeps_stale_data() {
        let poller = TelemetryPoller::new();
        let source = Arc::new(SimulatedSource::new());
        poller.start(source.clone(), Duration::from_millis(10));
        wait_for(|| poller.get_latest().is_some()).await;

        source.lose_link();
        wait_for(|| poller.state() == PollerState::Idle).await;
        assert!(!poller.is_active());
        assert!(poller.get_latest().is_some());

        // A new session may be started afterwards.
        let fresh = Arc::new(SimulatedSource::new());
        assert_eq!(poller.start(fresh, Duration::from_millis(10)), StartOutcome::Started);
        poller.stop();
    }

    #[tokio::test]
    async fn test_bad_sensor_does_not_abort_loop() {
        let poller = TelemetryPoller::new();
        let source = Arc::new(SimulatedSource::new());
        source.fail_sensor(SensorId::O2B1S2);
        poller.start(source, Duration::from_millis(10));

        wait_for(|| poller.session_info().is_some_and(|i| i.cycles >= 3)).await;
        let snapshot = poller.get_latest().unwrap();
        assert_eq!(snapshot.get(SensorId::O2B1S2), Some(&Reading::Unavailable));
        assert!(poller.is_active());
        poller.stop();
    }

    #[tokio::test]
    async fn test_poll_once_is_outside_session() {
        let poller = TelemetryPoller::new();
        let source = SimulatedSource::with_readings([(SensorId::CoolantTemp, "110 degC")]);
        let snapshot = poller.poll_once(&source, QueryMode::FreezeFrame).await.unwrap();
        assert_eq!(snapshot.raw(SensorId::CoolantTemp).as_deref(), Some("110 degC"));
        assert!(poller.get_latest().is_none());
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[tokio::test]
    async fn test_panicking_source_ends_session() {
        let poller = TelemetryPoller::new();
        assert_eq!(
            poller.start(Arc::new(PanickingSource), Duration::from_millis(10)),
            StartOutcome::Started
        );

        wait_for(|| poller.state() == PollerState::Idle).await;
        assert!(!poller.is_active());
        assert!(!poller.stop());
        assert!(poller.get_latest().is_none());

        let source = Arc::new(SimulatedSource::new());
        assert_eq!(
            poller.start(source, Duration::from_millis(10)),
            StartOutcome::Started
        );
        wait_for(|| poller.get_latest().is_some()).await;
        poller.stop();
    }

    #[tokio::test]
    async fn test_stop_during_acquisition_discards_snapshot() {
        let poller = TelemetryPoller::new();
        let source = Arc::new(SimulatedSource::new());
        // Twelve queries at 20ms make one acquisition last about 240ms.
        source.set_query_delay(Duration::from_millis(20));
        poller.start(source.clone(), Duration::from_millis(10));

        wait_for(|| source.query_count() > 0).await;
        assert!(poller.stop());
        assert_eq!(poller.state(), PollerState::Stopping);

        wait_for(|| poller.state() == PollerState::Idle).await;
        assert!(poller.get_latest().is_none());
        assert_eq!(poller.session_info().map(|i| i.cycles), Some(0));
    }

    #[tokio::test]
    async fn test_subscribers_see_each_publication() {
        let poller = TelemetryPoller::new();
        let mut updates = poller.subscribe();
        assert!(updates.borrow().is_none());

        let source = Arc::new(SimulatedSource::cycle_counter());
        poller.start(source, Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .unwrap()
            .unwrap();
        let first = updates.borrow_and_update().clone().unwrap();
        tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .unwrap()
            .unwrap();
        let second = updates.borrow_and_update().clone().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        let rpm = |snapshot: &SensorSnapshot| snapshot.get(SensorId::Rpm).and_then(|r| r.value());
        assert!(rpm(&second) > rpm(&first));
        poller.stop();
    }
}
