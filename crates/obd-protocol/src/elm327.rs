//! ELM327 Serial Adapter
//!
//! Talks to ELM327-compatible OBD-II adapters over a serial port using the
//! adapter's text command set: `<service><pid>\r` out, hex bytes and a `>`
//! prompt back.

use crate::error::ObdError;
use crate::mode;
use crate::protocol::ObdProtocol;
use crate::sensor::{Reading, SensorId};
use crate::source::{QueryMode, SourceConnector, TelemetrySource};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Default timeout for OBD commands
const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// The first data request triggers the adapter's protocol search
const SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Silence after which a late reply is assumed to have been fully discarded
const RESYNC_WINDOW: Duration = Duration::from_millis(100);

/// Serial settings for ELM327 adapters
#[derive(Debug, Clone)]
pub struct Elm327Config {
    /// Baud rate for serial communication
    pub baud_rate: u32,
    /// Per-command timeout
    pub query_timeout: Duration,
    /// Bus protocol
    pub protocol: ObdProtocol,
}

impl Default for Elm327Config {
    fn default() -> Self {
        Self {
            baud_rate: 38400,
            query_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            protocol: ObdProtocol::Auto,
        }
    }
}

/// Open link to an ELM327 adapter
pub struct Elm327Source {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    port_name: String,
    /// `None` once closed
    port: Mutex<Option<SerialStream>>,
    live: AtomicBool,
    /// Set when a command timed out and its reply may still arrive
    resync: AtomicBool,
    query_timeout: Duration,
}

impl Elm327Source {
    /// Open the serial port and run the adapter initialization sequence
    pub async fn open(port_name: &str, config: &Elm327Config) -> Result<Self, ObdError> {
        info!("Opening ELM327 adapter on {}", port_name);
        let stream = tokio_serial::new(port_name, config.baud_rate).open_native_async()?;

        let source = Self {
            port_name: port_name.to_string(),
            port: Mutex::new(Some(stream)),
            live: AtomicBool::new(true),
            resync: AtomicBool::new(false),
            query_timeout: config.query_timeout,
        };
        source.initialize(config.protocol).await?;

        info!("ELM327 adapter on {} initialized", port_name);
        Ok(source)
    }

    async fn initialize(&self, protocol: ObdProtocol) -> Result<(), ObdError> {
        let banner = self.command("ATZ", self.query_timeout).await?;
        if !banner.to_ascii_uppercase().contains("ELM") {
            return Err(ObdError::AdapterNotResponding);
        }

        for cmd in ["ATE0", "ATL0", "ATS0", "ATH0", protocol.to_elm_command()] {
            let reply = self.command(cmd, self.query_timeout).await?;
            if !reply.contains("OK") {
                return Err(ObdError::InvalidResponse(format!("{} -> {}", cmd, reply)));
            }
        }

        let timeout = if protocol.needs_search() {
            SEARCH_TIMEOUT.max(self.query_timeout)
        } else {
            self.query_timeout
        };
        let reply = self.command("0100", timeout).await?;
        if !compact(&reply).contains("4100") {
            return Err(ObdError::VehicleNotConnected);
        }
        Ok(())
    }

    /// Send one command and collect the reply up to the `>` prompt
    async fn command(&self, cmd: &str, timeout: Duration) -> Result<String, ObdError> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or(ObdError::ConnectionClosed)?;
        debug!(command = cmd, port = %self.port_name, "ELM327 request");

        let resync = self.resync.swap(false, Ordering::SeqCst);
        match tokio::time::timeout(timeout, exchange(port, cmd, resync)).await {
            Ok(Ok(reply)) => {
                debug!(command = cmd, reply = %reply, "ELM327 reply");
                Ok(reply)
            }
            Ok(Err(e)) => {
                if e.is_link_error() {
                    warn!("ELM327 link on {} failed: {}", self.port_name, e);
                    self.live.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
            Err(_) => {
                debug!(command = cmd, "ELM327 reply overdue, resyncing before next command");
                self.resync.store(true, Ordering::SeqCst);
                Err(ObdError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}

/// Write one command and read its reply up to the `>` prompt.
///
/// With `resync` set, input left over from an earlier timed-out command is
/// discarded first so the reply read belongs to this command.
async fn exchange<S>(port: &mut S, cmd: &str, resync: bool) -> Result<String, ObdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if resync {
        let discarded = drain_stale(port, RESYNC_WINDOW).await?;
        if discarded > 0 {
            debug!(bytes = discarded, "Discarded stale ELM327 reply");
        }
    }

    port.write_all(format!("{}\r", cmd).as_bytes()).await?;
    port.flush().await?;

    let mut reply = Vec::with_capacity(64);
    let mut buf = [0u8; 64];
    loop {
        let n = port.read(&mut buf).await?;
        if n == 0 {
            return Err(ObdError::AdapterNotResponding);
        }
        reply.extend_from_slice(&buf[..n]);
        if reply.contains(&b'>') {
            break;
        }
    }
    let text = String::from_utf8_lossy(&reply).replace('>', "");
    Ok(text.trim().to_string())
}

/// Read and drop input until a prompt is seen or `window` passes in silence
async fn drain_stale<S>(port: &mut S, window: Duration) -> Result<usize, ObdError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    let mut discarded = 0;
    loop {
        match tokio::time::timeout(window, port.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => return Ok(discarded),
            Ok(Ok(n)) => {
                discarded += n;
                if buf[..n].contains(&b'>') {
                    return Ok(discarded);
                }
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl TelemetrySource for Elm327Source {
    async fn query(&self, mode: QueryMode, sensor: SensorId) -> Result<Option<Reading>, ObdError> {
        let cmd = request(mode, sensor);
        let reply = self.command(&cmd, self.query_timeout).await?;
        let bytes = parse_data(&reply, mode, sensor)?;
        Ok(bytes
            .and_then(|b| sensor.decode(&b))
            .map(|value| sensor.reading(value)))
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn clear_codes(&self) -> Result<(), ObdError> {
        let reply = self
            .command(&format!("{:02X}", mode::CLEAR_DTC), self.query_timeout)
            .await?;
        let expected = format!("{:02X}", mode::CLEAR_DTC + mode::RESPONSE_OFFSET);
        if compact(&reply).contains(&expected) {
            info!("Stored trouble codes cleared on {}", self.port_name);
            Ok(())
        } else {
            Err(ObdError::InvalidResponse(reply))
        }
    }

    async fn close(&self) -> Result<(), ObdError> {
        let mut guard = self.port.lock().await;
        self.live.store(false, Ordering::SeqCst);
        match guard.take() {
            Some(mut port) => {
                // Return the adapter to low power; the port closes on drop either way.
                if let Err(e) = port.write_all(b"ATLP\r").await {
                    debug!("ELM327 low-power request failed: {}", e);
                }
                info!("Closed ELM327 adapter on {}", self.port_name);
                Ok(())
            }
            None => Err(ObdError::ConnectionClosed),
        }
    }

    fn port_name(&self) -> String {
        self.port_name.clone()
    }
}

/// Opens [`Elm327Source`] handles, scanning serial ports when no target is given
#[derive(Debug, Clone, Default)]
pub struct Elm327Connector {
    config: Elm327Config,
}

impl Elm327Connector {
    /// Create a connector with the given serial settings
    pub fn new(config: Elm327Config) -> Self {
        Self { config }
    }

    async fn discover(&self) -> Result<Elm327Source, ObdError> {
        let ports = tokio_serial::available_ports()?;
        info!("Scanning {} serial ports for an ELM327 adapter", ports.len());
        for info in ports {
            match Elm327Source::open(&info.port_name, &self.config).await {
                Ok(source) => return Ok(source),
                Err(e) => debug!("No adapter on {}: {}", info.port_name, e),
            }
        }
        Err(ObdError::NoAdapterFound)
    }
}

#[async_trait]
impl SourceConnector for Elm327Connector {
    async fn open(
        &self,
        target: Option<&str>,
        timeout: Duration,
    ) -> Result<Arc<dyn TelemetrySource>, ObdError> {
        let attempt = async {
            match target {
                Some(port) => Elm327Source::open(port, &self.config).await,
                None => self.discover().await,
            }
        };
        let source = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| ObdError::Timeout(timeout.as_millis() as u64))??;
        let source: Arc<dyn TelemetrySource> = Arc::new(source);
        Ok(source)
    }
}

fn request(mode: QueryMode, sensor: SensorId) -> String {
    match mode {
        QueryMode::CurrentData => format!("{:02X}{:02X}", mode.service(), sensor.pid()),
        // frame number 00
        QueryMode::FreezeFrame => format!("{:02X}{:02X}00", mode.service(), sensor.pid()),
    }
}

fn compact(reply: &str) -> String {
    reply
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Extract the data bytes answering `sensor` from an adapter reply
fn parse_data(
    reply: &str,
    mode: QueryMode,
    sensor: SensorId,
) -> Result<Option<Vec<u8>>, ObdError> {
    let reply = compact(reply);
    if reply.contains("NODATA") {
        return Ok(None);
    }
    if ["UNABLETOCONNECT", "BUSERROR", "CANERROR", "BUSINIT"]
        .iter()
        .any(|marker| reply.contains(marker))
    {
        return Err(ObdError::VehicleNotConnected);
    }

    let mut header = format!(
        "{:02X}{:02X}",
        mode.service() + mode::RESPONSE_OFFSET,
        sensor.pid()
    );
    if mode == QueryMode::FreezeFrame {
        header.push_str("00");
    }

    let start = reply
        .find(&header)
        .ok_or_else(|| ObdError::InvalidResponse(reply.clone()))?
        + header.len();
    // Bytes, not chars: a garbled reply may carry multi-byte replacement characters.
    let hex = &reply.as_bytes()[start..];
    let needed = sensor.response_bytes();
    if hex.len() < needed * 2 {
        return Err(ObdError::InvalidResponse(reply.clone()));
    }

    hex.chunks_exact(2)
        .take(needed)
        .map(|pair| hex_byte(pair).ok_or_else(|| ObdError::InvalidResponse(reply.clone())))
        .collect::<Result<Vec<u8>, ObdError>>()
        .map(Some)
}

fn hex_byte(pair: &[u8]) -> Option<u8> {
    let hi = char::from(pair[0]).to_digit(16)?;
    let lo = char::from(pair[1]).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}
