//! Server Configuration
//!
//! Layered: built-in defaults, then an optional TOML file, then
//! `OBD_CORE__SECTION__KEY` environment variables.

use explain_gateway::{GatewayConfig, RetryPolicy, DEFAULT_ENDPOINT};
use obd_protocol::{Elm327Config, ObdProtocol};
use obd_session::ConnectionSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "obd-core.toml";

/// Environment variable naming an alternative config file
pub const CONFIG_PATH_ENV: &str = "OBD_CORE_CONFIG";

const ENV_PREFIX: &str = "OBD_CORE";

/// Which telemetry source to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Elm327,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Serial port; discovered when unset
    pub port: Option<String>,
    pub baud_rate: u32,
    pub protocol: ObdProtocol,
    pub connect_timeout_secs: f64,
    pub query_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Elm327,
            port: None,
            baud_rate: 38400,
            protocol: ObdProtocol::Auto,
            connect_timeout_secs: 5.0,
            query_timeout_ms: 2000,
        }
    }
}

impl SourceConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            target: self.port.clone(),
            timeout: secs(self.connect_timeout_secs, 5.0),
        }
    }

    pub fn elm327(&self) -> Elm327Config {
        Elm327Config {
            baud_rate: self.baud_rate,
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            protocol: self.protocol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_secs: 1.0 }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        secs(self.interval_secs, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub url: String,
    pub timeout_secs: f64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT.to_string(),
            timeout_secs: 60.0,
        }
    }
}

impl GatewaySettings {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            url: self.url.clone(),
            timeout: secs(self.timeout_secs, 60.0),
            retry: RetryPolicy::gateway(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub poller: PollerConfig,
    pub gateway: GatewaySettings,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load from `path`, falling back to `OBD_CORE_CONFIG` and then
    /// `obd-core.toml`. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let file = match path {
            Some(p) => p.to_string_lossy().into_owned(),
            None => std::env::var(CONFIG_PATH_ENV)
                .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string()),
        };

        config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// Seconds to a duration; negative or non-finite values use `fallback`
fn secs(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}
