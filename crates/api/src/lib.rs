//! OBD Diagnostic Core API Server
//!
//! HTTP surface over the connection manager, telemetry poller, fault rules
//! and explanation gateway.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use explain_gateway::{GatewayClient, GatewayError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use obd_protocol::{Elm327Connector, SimulatedConnector, SourceConnector, TelemetrySource};
use obd_session::{ConnectionManager, ConnectionSettings, PollerState, SessionInfo, TelemetryPoller};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod routes;

pub use config::{
    AppConfig, GatewaySettings, LogConfig, PollerConfig, ServerConfig, SourceConfig, SourceKind,
    CONFIG_PATH_ENV, DEFAULT_CONFIG_FILE,
};
pub use error::ApiError;

/// Application state shared across handlers
pub struct AppState {
    /// Owner of the telemetry source handle and the poller
    pub connections: ConnectionManager,
    /// Explanation service client
    pub gateway: GatewayClient,
    /// Interval used by `/live/start`
    pub poll_interval: Duration,
    /// Prometheus renderer, when the recorder is installed
    pub metrics: Option<PrometheusHandle>,
    /// Version string
    pub version: String,
    /// Start time
    pub start_time: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        settings: ConnectionSettings,
        gateway: GatewayClient,
        poll_interval: Duration,
    ) -> Self {
        let poller = Arc::new(TelemetryPoller::new());
        Self {
            connections: ConnectionManager::new(connector, poller, settings),
            gateway,
            poll_interval,
            metrics: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Instant::now(),
        }
    }

    /// Build state from configuration
    pub fn from_config(config: &AppConfig) -> Result<Self, GatewayError> {
        let connector: Arc<dyn SourceConnector> = match config.source.kind {
            SourceKind::Elm327 => Arc::new(Elm327Connector::new(config.source.elm327())),
            SourceKind::Simulated => Arc::new(SimulatedConnector::new()),
        };
        let gateway = GatewayClient::new(config.gateway.gateway_config())?;
        Ok(Self::new(
            connector,
            config.source.connection_settings(),
            gateway,
            config.poller.interval(),
        ))
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn poller(&self) -> &Arc<TelemetryPoller> {
        self.connections.poller()
    }

    /// The stored handle if it is still live
    pub async fn require_handle(&self) -> Result<Arc<dyn TelemetrySource>, ApiError> {
        match self.connections.current_handle().await {
            Some(handle) if handle.is_live() => Ok(handle),
            _ => Err(ApiError::NotConnected),
        }
    }

    /// Stop polling and release the telemetry source
    pub async fn shutdown(&self) {
        if let Err(e) = self.connections.disconnect().await {
            warn!("Closing telemetry source during shutdown failed: {}", e);
        }
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connected: bool,
    pub poller: PollerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

/// Create the application router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/connect", get(routes::connection::connect))
        .route("/disconnect", get(routes::connection::disconnect))
        .route("/ping", get(routes::connection::ping))
        .route("/dtc", get(routes::diagnostics::get_dtc))
        .route("/dtc/explain/:code", get(routes::diagnostics::explain))
        .route("/freeze", get(routes::diagnostics::get_freeze))
        .route("/clear", get(routes::diagnostics::clear_codes))
        .route("/live/start", get(routes::live::start))
        .route("/live/stop", get(routes::live::stop))
        .route("/live/data", get(routes::live::data))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        connected: state.connections.is_connected().await,
        poller: state.poller().state(),
        session: state.poller().session_info(),
    })
}

/// Prometheus text exposition
async fn metrics_handler(State(state): State<SharedState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}

/// Initialize logging. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

/// Run the server until Ctrl-C, then release the telemetry source
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let mut state = AppState::from_config(&config)?;
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => state = state.with_metrics(handle),
        Err(e) => warn!("Metrics recorder not installed: {}", e),
    }
    let state = Arc::new(state);
    let app = create_router(state.clone());

    info!("Starting API server on {}", config.server.bind);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    state.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use explain_gateway::{GatewayConfig, RetryPolicy};
    use obd_protocol::{SensorId, SimulatedSource};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const SCENARIO: [(SensorId, &str); 12] = [
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
    ];

    fn gateway(url: &str) -> GatewayClient {
        GatewayClient::new(GatewayConfig {
            url: url.to_string(),
            timeout: Duration::from_secs(2),
            retry: RetryPolicy::gateway().with_backoff(Duration::from_millis(10)),
        })
        .unwrap()
    }

    fn app_with(connector: Arc<dyn SourceConnector>, gateway_url: &str) -> Router {
        let state = AppState::new(
            connector,
            ConnectionSettings::default(),
            gateway(gateway_url),
            Duration::from_millis(10),
        );
        create_router(Arc::new(state))
    }

    fn app_for(source: Arc<SimulatedSource>) -> Router {
        app_with(
            Arc::new(SimulatedConnector::with_source(source)),
            "http://127.0.0.1:9/explain",
        )
    }

    async fn call(app: &Router, path: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_ping() {
        let app = app_for(Arc::new(SimulatedSource::new()));
        assert_eq!(call(&app, "/ping").await, (StatusCode::OK, json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_routes_require_connection() {
        let app = app_for(Arc::new(SimulatedSource::new()));
        for path in ["/dtc", "/freeze", "/clear", "/live/start", "/dtc/explain/P0171"] {
            let (status, body) = call(&app, path).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", path);
            assert_eq!(body, json!({"error": "not connected"}), "{}", path);
        }
    }

    #[tokio::test]
    async fn test_connect_disconnect_cycle() {
        let app = app_for(Arc::new(SimulatedSource::new()));

        let (_, body) = call(&app, "/connect").await;
        assert_eq!(body, json!({"status": "connected", "port": "simulated"}));
        let (_, body) = call(&app, "/connect").await;
        assert_eq!(body["status"], "already_connected");

        assert_eq!(call(&app, "/disconnect").await.1, json!({"status": "disconnected"}));
        assert_eq!(call(&app, "/disconnect").await.1, json!({"status": "not_connected"}));
    }

    #[tokio::test]
    async fn test_failed_connect_reports_detail() {
        let connector = Arc::new(SimulatedConnector::new());
        connector.refuse_connections(true);
        let app = app_with(connector, "http://127.0.0.1:9/explain");

        let (status, body) = call(&app, "/connect").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn test_disconnect_close_failure_is_500() {
        let source = Arc::new(SimulatedSource::new());
        source.fail_close(true);
        let app = app_for(source);
        call(&app, "/connect").await;

        let (status, body) = call(&app, "/disconnect").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert_eq!(call(&app, "/dtc").await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_acquisition_failure_is_500() {
        let source = Arc::new(SimulatedSource::new());
        let app = app_for(source.clone());
        call(&app, "/connect").await;
        source.silence_vehicle(true);

        for path in ["/freeze", "/dtc"] {
            let (status, body) = call(&app, path).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{}", path);
            assert!(body["error"].is_string(), "{}", path);
        }
        assert_eq!(source.query_count(), 24);
    }

    #[tokio::test]
    async fn test_dtc_evaluates_freeze_frame() {
        let app = app_for(Arc::new(SimulatedSource::with_readings(SCENARIO)));
        call(&app, "/connect").await;

        let (status, body) = call(&app, "/dtc").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([
                ["P0101", "MAF Circuit Range/Performance"],
                ["P0171", "System Too Lean Bank 1"],
                ["P0300", "Random Misfire Detected Code"]
            ])
        );
    }

    #[tokio::test]
    async fn test_freeze_frame_read() {
        let source = Arc::new(SimulatedSource::with_readings(SCENARIO));
        source.fail_sensor(SensorId::FuelPressure);
        let app = app_for(source);
        call(&app, "/connect").await;

        let (status, body) = call(&app, "/freeze").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["RPM"], "300");
        assert_eq!(body["MAF"], "0.2");
        assert_eq!(body["FUEL_PRESSURE"], "N/A");
        assert_eq!(body.as_object().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_clear_codes() {
        let source = Arc::new(SimulatedSource::new());
        let app = app_for(source.clone());
        call(&app, "/connect").await;

        let (_, body) = call(&app, "/clear").await;
        assert_eq!(body, json!({"result": "DTCs cleared successfully."}));
        assert_eq!(source.clear_count(), 1);
    }

    #[tokio::test]
    async fn test_live_polling() {
        let app = app_for(Arc::new(SimulatedSource::new()));
        assert_eq!(call(&app, "/live/data").await.1, json!({}));

        call(&app, "/connect").await;
        assert_eq!(call(&app, "/live/start").await.1, json!({"status": "started"}));
        assert_eq!(call(&app, "/live/start").await.1, json!({"status": "started"}));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (_, data) = call(&app, "/live/data").await;
        assert_eq!(data.as_object().unwrap().len(), 12);

        let (_, health) = call(&app, "/health").await;
        assert_eq!(health["connected"], true);
        assert_eq!(health["poller"], "running");

        assert_eq!(call(&app, "/live/stop").await.1, json!({"status": "stopped"}));
        assert_eq!(call(&app, "/live/stop").await.1, json!({"status": "stopped"}));
    }

    #[tokio::test]
    async fn test_explain_rejects_malformed_code() {
        let app = app_for(Arc::new(SimulatedSource::new()));
        call(&app, "/connect").await;
        let (status, body) = call(&app, "/dtc/explain/NOPE").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("NOPE"));
    }

    #[tokio::test]
    async fn test_explain_forwards_freeze_frame() {
        let upstream = Router::new().route(
            "/explain",
            axum::routing::post(|Json(body): Json<Value>| async move {
                let code = body["code"].as_str().unwrap_or("");
                let rpm = body["freeze_frame"]["RPM"].as_str().unwrap_or("");
                Json(json!({ "explanation": format!("{} at {}", code, rpm) }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/explain", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let app = app_with(
            Arc::new(SimulatedConnector::with_source(Arc::new(
                SimulatedSource::with_readings(SCENARIO),
            ))),
            &url,
        );
        call(&app, "/connect").await;

        let (status, body) = call(&app, "/dtc/explain/p0171").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], "P0171");
        assert_eq!(body["freeze_frame"]["MAF"], "0.2");
        assert_eq!(body["explanation"], "P0171 at 300");
    }

    #[tokio::test]
    async fn test_explain_gateway_failure_is_structured() {
        let app = app_for(Arc::new(SimulatedSource::new()));
        call(&app, "/connect").await;

        let (status, body) = call(&app, "/dtc/explain/P0420").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], "P0420");
        assert!(body["error"].is_string());
        assert!(body.get("explanation").is_none());
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let app = app_for(Arc::new(SimulatedSource::new()));
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
