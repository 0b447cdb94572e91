//! PHD2 guiding client
//!
//! PHD2 speaks JSON-RPC 2.0 over TCP, one JSON object per CRLF-terminated
//! line. Commands are answered with a response carrying our id, and progress
//! is reported through unsolicited event messages which a reader task
//! broadcasts to whoever is waiting.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use skywatch_sequencer::{Autoguider, DeviceError, DeviceResult, SettleSpec};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long PHD2 gets to announce itself, and to acknowledge a stop
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Headroom on top of the settle timeout, since calibration can precede settling
const CALIBRATION_ALLOWANCE: Duration = Duration::from_secs(300);
const DITHER_ALLOWANCE: Duration = Duration::from_secs(10);

/// A message received from PHD2
#[derive(Debug, Clone, PartialEq)]
pub enum Phd2Event {
    Version(String),
    StartCalibration,
    Calibrating(String),
    CalibrationFailed(String),
    GuideStep,
    Settling { distance: f64, time: f64 },
    SettleDone { status: i64, error: Option<String> },
    LoopingExposures,
    StarLost,
    /// Any other event, by name
    Other(String),
    /// Reply to one of our commands
    Response { id: u64, error: Option<String> },
    /// The socket was closed or failed; nothing more will arrive
    ConnectionClosed,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "Event")]
    event: Option<String>,
    #[serde(rename = "PHDVersion")]
    version: Option<String>,
    #[serde(rename = "State")]
    state: Option<String>,
    #[serde(rename = "Reason")]
    reason: Option<String>,
    #[serde(rename = "Status")]
    status: Option<i64>,
    #[serde(rename = "Error")]
    settle_error: Option<String>,
    #[serde(rename = "Distance")]
    distance: Option<f64>,
    #[serde(rename = "Time")]
    time: Option<f64>,
    id: Option<u64>,
    error: Option<RpcError>,
}

/// Parse one line from PHD2; `None` for blank or malformed lines
pub fn parse_message(line: &str) -> Option<Phd2Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw: RawMessage = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(target: "phd2", "Ignoring unparseable line ({}): {}", e, line);
            return None;
        }
    };

    let Some(event) = raw.event else {
        return raw.id.map(|id| Phd2Event::Response {
            id,
            error: raw.error.map(|e| e.message),
        });
    };

    Some(match event.as_str() {
        "Version" => Phd2Event::Version(raw.version.unwrap_or_default()),
        "StartCalibration" => Phd2Event::StartCalibration,
        "Calibrating" => Phd2Event::Calibrating(raw.state.unwrap_or_default()),
        "CalibrationFailed" => Phd2Event::CalibrationFailed(raw.reason.unwrap_or_default()),
        "GuideStep" => Phd2Event::GuideStep,
        "Settling" => Phd2Event::Settling {
            distance: raw.distance.unwrap_or(f64::NAN),
            time: raw.time.unwrap_or(f64::NAN),
        },
        "SettleDone" => Phd2Event::SettleDone {
            status: raw.status.unwrap_or(-1),
            error: raw.settle_error.filter(|e| !e.is_empty()),
        },
        "LoopingExposures" => Phd2Event::LoopingExposures,
        "StarLost" => Phd2Event::StarLost,
        _ => Phd2Event::Other(event),
    })
}

fn settle_params(settle: &SettleSpec) -> Value {
    json!({
        "pixels": settle.pixels,
        "time": settle.time_secs,
        "timeout": settle.timeout_secs,
    })
}

fn settle_result(operation: &str, status: i64, error: Option<String>) -> DeviceResult<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(DeviceError::rejected(
            operation,
            format!(
                "settling failed with status {}: {}",
                status,
                error.unwrap_or_else(|| "no reason given".to_string())
            ),
        ))
    }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct Phd2Client {
    tx: mpsc::Sender<String>,
    events: broadcast::Sender<Phd2Event>,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    version: String,
}

impl Phd2Client {
    /// Connect, wait for PHD2's version announcement and connect its equipment
    pub async fn connect(host: &str, port: u16) -> DeviceResult<Self> {
        let addr = format!("{}:{}", host, port);
        tracing::info!(target: "phd2", "Connecting to PHD2 at {}", addr);
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DeviceError::Disconnected(format!("PHD2 at {}: {}", addr, e)));
            }
            Err(_) => {
                return Err(DeviceError::timeout(
                    format!("connect to PHD2 at {}", addr),
                    CONNECT_TIMEOUT,
                ));
            }
        };
        Self::from_stream(stream).await
    }

    async fn from_stream<S>(stream: S) -> DeviceResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel::<String>(32);
        let (events, _) = broadcast::channel(256);

        // Subscribe before the reader starts so the Version event is not missed
        let mut announcements = events.subscribe();
        tokio::spawn(writer_task(write_half, rx));
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(reader_task(read_half, events.clone(), connected.clone()));

        let mut client = Self {
            tx,
            events,
            connected,
            next_id: AtomicU64::new(0),
            reader,
            version: String::new(),
        };

        let version = wait_for(&mut announcements, "PHD2 handshake", REPLY_TIMEOUT, |event| match event {
            Phd2Event::Version(version) => Some(Ok(version.clone())),
            _ => None,
        })
        .await?;
        tracing::info!(target: "phd2", "Connected to PHD2 version {}", version);
        client.version = version;

        client.send_command("set_connected", json!({ "connect": true })).await?;
        Ok(client)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    async fn send_command(&self, method: &str, params: Value) -> DeviceResult<u64> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DeviceError::Disconnected("PHD2 connection closed".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        })
        .to_string();
        tracing::debug!(target: "phd2", "Request sent: {}", message);
        self.tx
            .send(message)
            .await
            .map_err(|_| DeviceError::Disconnected("PHD2 connection closed".to_string()))?;
        Ok(id)
    }
}

impl Drop for Phd2Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn writer_task<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<String>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.write_all(message.as_bytes()).await {
            tracing::error!(target: "phd2", "PHD2 write error: {}", e);
            break;
        }
        if let Err(e) = writer.write_all(b"\r\n").await {
            tracing::error!(target: "phd2", "PHD2 write error: {}", e);
            break;
        }
    }
}

async fn reader_task<R: AsyncRead + Unpin>(
    reader: R,
    events: broadcast::Sender<Phd2Event>,
    connected: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(event) = parse_message(&line) {
                    let _ = events.send(event);
                }
            }
            Ok(None) => {
                tracing::warn!(target: "phd2", "PHD2 closed the connection");
                break;
            }
            Err(e) => {
                tracing::error!(target: "phd2", "PHD2 read error: {}", e);
                break;
            }
        }
    }
    // Flag first: a command sent after this fails at once, one sent before
    // it has a subscriber that sees the event.
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(Phd2Event::ConnectionClosed);
}

/// Feed events to `decide` until it returns a verdict or `limit` passes
async fn wait_for<T, F>(
    rx: &mut broadcast::Receiver<Phd2Event>,
    operation: &str,
    limit: Duration,
    mut decide: F,
) -> DeviceResult<T>
where
    F: FnMut(&Phd2Event) -> Option<DeviceResult<T>>,
{
    let deadline = Instant::now() + limit;
    loop {
        let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) => return Err(DeviceError::timeout(operation, limit)),
            Ok(Err(RecvError::Lagged(skipped))) => {
                tracing::warn!(target: "phd2", "Missed {} PHD2 messages", skipped);
                continue;
            }
            Ok(Ok(Phd2Event::ConnectionClosed)) | Ok(Err(RecvError::Closed)) => {
                return Err(DeviceError::Disconnected(format!(
                    "PHD2 connection closed during {}",
                    operation
                )))
            }
            Ok(Ok(event)) => event,
        };
        if let Some(verdict) = decide(&event) {
            return verdict;
        }
    }
}

/// Error reply to command `id`, if this event is one
fn rejection(event: &Phd2Event, id: u64, command: &str) -> Option<DeviceError> {
    match event {
        Phd2Event::Response {
            id: reply,
            error: Some(message),
        } if *reply == id => Some(DeviceError::rejected(command, message.clone())),
        _ => None,
    }
}

#[async_trait]
impl Autoguider for Phd2Client {
    async fn start(&self, settle: &SettleSpec) -> DeviceResult<()> {
        tracing::info!(
            target: "phd2",
            "Starting guiding (settle {} px for {} s, timeout {} s)",
            settle.pixels,
            settle.time_secs,
            settle.timeout_secs
        );
        let mut rx = self.events.subscribe();
        let id = self
            .send_command(
                "guide",
                json!({ "settle": settle_params(settle), "recalibrate": true }),
            )
            .await?;

        let limit = Duration::from_secs_f64(settle.timeout_secs.max(0.0)) + CALIBRATION_ALLOWANCE;
        wait_for(&mut rx, "start guiding", limit, |event| {
            if let Some(err) = rejection(event, id, "guide") {
                return Some(Err(err));
            }
            match event {
                Phd2Event::SettleDone { status, error } => {
                    Some(settle_result("guide", *status, error.clone()))
                }
                Phd2Event::GuideStep => {
                    tracing::info!(target: "phd2", "Guiding started without a settle report");
                    Some(Ok(()))
                }
                Phd2Event::CalibrationFailed(reason) => {
                    Some(Err(DeviceError::rejected("guide", format!("calibration failed: {}", reason))))
                }
                Phd2Event::StartCalibration => {
                    tracing::info!(target: "phd2", "Calibration started");
                    None
                }
                Phd2Event::Calibrating(state) => {
                    tracing::debug!(target: "phd2", "Calibrating: {}", state);
                    None
                }
                _ => None,
            }
        })
        .await?;
        tracing::info!(target: "phd2", "Guiding settled");
        Ok(())
    }

    async fn stop(&self) -> DeviceResult<()> {
        tracing::info!(target: "phd2", "Stopping guiding, looping exposures");
        let mut rx = self.events.subscribe();
        let id = self.send_command("loop", json!({})).await?;
        wait_for(&mut rx, "stop guiding", REPLY_TIMEOUT, |event| {
            if let Some(err) = rejection(event, id, "loop") {
                return Some(Err(err));
            }
            match event {
                Phd2Event::LoopingExposures => Some(Ok(())),
                _ => None,
            }
        })
        .await
    }

    async fn dither(&self, pixels: f64, settle: &SettleSpec) -> DeviceResult<()> {
        tracing::info!(target: "phd2", "Dithering {} px", pixels);
        let mut rx = self.events.subscribe();
        let id = self
            .send_command(
                "dither",
                json!({ "amount": pixels, "raOnly": false, "settle": settle_params(settle) }),
            )
            .await?;

        let limit = Duration::from_secs_f64(settle.timeout_secs.max(0.0)) + DITHER_ALLOWANCE;
        wait_for(&mut rx, "dither", limit, |event| {
            if let Some(err) = rejection(event, id, "dither") {
                return Some(Err(err));
            }
            match event {
                Phd2Event::SettleDone { status, error } => {
                    Some(settle_result("dither", *status, error.clone()))
                }
                Phd2Event::Settling { distance, time } => {
                    tracing::debug!(target: "phd2", "Dither settling: {:.2} px, {:.1} s", distance, time);
                    None
                }
                _ => None,
            }
        })
        .await
    }
}
