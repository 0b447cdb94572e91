//! INDI client core: connection, property cache and XML reader task

use crate::error::{IndiError, IndiResult};
use crate::protocol::{self, standard_properties::*};
use crate::{
    IndiPermission, IndiProperty, IndiPropertyState, IndiPropertyType, IndiTimeoutConfig,
    INDI_DEFAULT_PORT,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{sleep, timeout};

type PropertyMap = HashMap<(String, String), IndiProperty>;
type PropertyValueMap = HashMap<(String, String, String), String>;

/// INDI client event
#[derive(Debug, Clone)]
pub enum IndiEvent {
    /// Property defined
    PropertyDefined(String, String, IndiPropertyType),
    /// Property updated (end of a set*Vector)
    PropertyUpdated(String, String),
    /// Property deleted
    PropertyDeleted(String, String),
    /// BLOB received and base64-decoded
    BlobReceived {
        device: String,
        property: String,
        element: String,
        data: Vec<u8>,
        format: String,
    },
    /// Connection state changed
    ConnectionStateChanged(bool),
}

/// INDI client for communicating with an INDI server
pub struct IndiClient {
    host: String,
    port: u16,
    connected: Arc<AtomicBool>,
    properties: Arc<RwLock<PropertyMap>>,
    property_values: Arc<RwLock<PropertyValueMap>>,
    tx: Option<mpsc::Sender<String>>,
    event_tx: broadcast::Sender<IndiEvent>,
    timeout_config: IndiTimeoutConfig,
}

impl IndiClient {
    /// Create a new INDI client
    pub fn new(host: &str, port: Option<u16>) -> Self {
        Self::with_timeout_config(host, port, IndiTimeoutConfig::default())
    }

    /// Create a new INDI client with custom timeout configuration
    pub fn with_timeout_config(
        host: &str,
        port: Option<u16>,
        timeout_config: IndiTimeoutConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            host: host.to_string(),
            port: port.unwrap_or(INDI_DEFAULT_PORT),
            connected: Arc::new(AtomicBool::new(false)),
            properties: Arc::new(RwLock::new(HashMap::new())),
            property_values: Arc::new(RwLock::new(HashMap::new())),
            tx: None,
            event_tx,
            timeout_config,
        }
    }

    pub fn timeout_config(&self) -> &IndiTimeoutConfig {
        &self.timeout_config
    }

    /// Subscribe to property and BLOB events
    pub fn subscribe(&self) -> broadcast::Receiver<IndiEvent> {
        self.event_tx.subscribe()
    }

    /// Connect to the INDI server
    pub async fn connect(&mut self) -> IndiResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let connection_timeout = self.timeout_config.connection_timeout();

        let stream = match timeout(connection_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(IndiError::ConnectionFailed(format!(
                    "Failed to connect to INDI server at {}: {}. Check that the server is running and the address is correct.",
                    addr, e
                )));
            }
            Err(_) => {
                return Err(IndiError::ConnectionTimeout {
                    host: self.host.clone(),
                    port: self.port,
                    duration: connection_timeout,
                });
            }
        };

        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel::<String>(100);
        self.tx = Some(tx);

        tokio::spawn(Self::writer_task(write_half, rx));

        let properties = self.properties.clone();
        let property_values = self.property_values.clone();
        let connected = self.connected.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            reader_task(read_half, properties, property_values, connected, event_tx).await;
        });

        self.connected.store(true, Ordering::SeqCst);
        let _ = self.event_tx.send(IndiEvent::ConnectionStateChanged(true));
        tracing::info!("Connected to INDI server {}", addr);

        self.send_command(&protocol::get_properties_message()).await
    }

    /// Writer task - sends commands to INDI server
    async fn writer_task<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<String>) {
        while let Some(cmd) = rx.recv().await {
            if let Err(e) = writer.write_all(cmd.as_bytes()).await {
                tracing::error!("INDI write error: {}", e);
                break;
            }
            if let Err(e) = writer.write_all(b"\n").await {
                tracing::error!("INDI write error: {}", e);
                break;
            }
        }
    }

    /// Disconnect from the INDI server
    pub async fn disconnect(&mut self) {
        tracing::info!("Disconnecting from INDI server {}:{}", self.host, self.port);
        self.tx = None;
        self.connected.store(false, Ordering::SeqCst);
        self.properties.write().await.clear();
        self.property_values.write().await.clear();
        let _ = self.event_tx.send(IndiEvent::ConnectionStateChanged(false));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn send_command(&self, command: &str) -> IndiResult<()> {
        if !self.is_connected() {
            return Err(IndiError::NotConnected);
        }
        if let Some(tx) = &self.tx {
            tx.send(command.to_string()).await.map_err(|e| {
                IndiError::ChannelClosed(format!(
                    "Failed to send INDI command to {}:{}: {}. The connection may have been lost.",
                    self.host, self.port, e
                ))
            })
        } else {
            Err(IndiError::NotConnected)
        }
    }

    // =========================================================================
    // PROPERTY CACHE ACCESS
    // =========================================================================

    /// Get a property
    pub async fn get_property(&self, device: &str, property: &str) -> Option<IndiProperty> {
        self.properties
            .read()
            .await
            .get(&(device.to_string(), property.to_string()))
            .cloned()
    }

    /// Get a raw element value
    pub async fn get_property_value(
        &self,
        device: &str,
        property: &str,
        element: &str,
    ) -> Option<String> {
        self.property_values
            .read()
            .await
            .get(&(device.to_string(), property.to_string(), element.to_string()))
            .cloned()
    }

    /// All (element, value) pairs of a property in definition order
    pub async fn get_elements(&self, device: &str, property: &str) -> Option<Vec<(String, String)>> {
        let prop = self.get_property(device, property).await?;
        let values = self.property_values.read().await;
        Some(
            prop.elements
                .iter()
                .filter_map(|elem| {
                    values
                        .get(&(device.to_string(), property.to_string(), elem.clone()))
                        .map(|v| (elem.clone(), v.clone()))
                })
                .collect(),
        )
    }

    pub async fn get_number(&self, device: &str, property: &str, element: &str) -> Option<f64> {
        self.get_property_value(device, property, element)
            .await
            .and_then(|v| parse_indi_number(&v))
    }

    pub async fn get_switch(&self, device: &str, property: &str, element: &str) -> Option<bool> {
        self.get_property_value(device, property, element)
            .await
            .map(|v| v.trim() == "On")
    }

    pub async fn get_property_state(
        &self,
        device: &str,
        property: &str,
    ) -> Option<IndiPropertyState> {
        self.get_property(device, property).await.map(|p| p.state)
    }

    pub async fn is_property_busy(&self, device: &str, property: &str) -> bool {
        matches!(
            self.get_property_state(device, property).await,
            Some(IndiPropertyState::Busy)
        )
    }

    pub async fn has_property(&self, device: &str, property: &str) -> bool {
        self.get_property(device, property).await.is_some()
    }

    /// Read a number element, failing with `PropertyNotFound` or `InvalidValue`
    pub async fn require_number(&self, device: &str, property: &str, element: &str) -> IndiResult<f64> {
        let raw = self
            .get_property_value(device, property, element)
            .await
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: device.to_string(),
                property: property.to_string(),
            })?;
        parse_indi_number(&raw).ok_or_else(|| IndiError::InvalidValue {
            device: device.to_string(),
            property: property.to_string(),
            element: element.to_string(),
            value: raw,
        })
    }

    // =========================================================================
    // PROPERTY WRITES
    // =========================================================================

    pub async fn enable_blob(&mut self, device: &str) -> IndiResult<()> {
        self.send_command(&protocol::enable_blob_message(device)).await
    }

    async fn check_write_permission(&self, device: &str, property: &str) -> IndiResult<()> {
        match self.get_property(device, property).await.map(|p| p.perm) {
            Some(IndiPermission::ReadOnly) => Err(IndiError::PermissionDenied(format!(
                "Property '{}.{}' is read-only",
                device, property
            ))),
            _ => Ok(()),
        }
    }

    /// Set a switch property with permission check
    pub async fn set_switch(
        &mut self,
        device: &str,
        property: &str,
        element: &str,
        state: bool,
    ) -> IndiResult<()> {
        self.check_write_permission(device, property).await?;
        self.send_command(&protocol::new_switch_vector(device, property, element, state))
            .await
    }

    /// Set a number property with permission check
    pub async fn set_number(
        &mut self,
        device: &str,
        property: &str,
        element: &str,
        value: f64,
    ) -> IndiResult<()> {
        self.set_numbers(device, property, &[(element, value)]).await
    }

    /// Set multiple number elements in one vector
    pub async fn set_numbers(
        &mut self,
        device: &str,
        property: &str,
        values: &[(&str, f64)],
    ) -> IndiResult<()> {
        self.check_write_permission(device, property).await?;
        self.send_command(&protocol::new_number_vector(device, property, values))
            .await
    }

    /// Connect to a device (turn on CONNECTION switch) and wait until the
    /// driver has defined `ready_property`
    pub async fn connect_device(&mut self, device: &str, ready_property: &str) -> IndiResult<()> {
        if self.is_device_connected(device).await {
            tracing::debug!("Device '{}' already connected", device);
        } else {
            self.set_switch(device, CONNECTION, CONNECT, true).await?;
        }
        let timeout_duration = self.timeout_config.property_timeout();
        self.wait_for_property(device, ready_property, timeout_duration)
            .await
    }

    pub async fn is_device_connected(&self, device: &str) -> bool {
        self.get_switch(device, CONNECTION, CONNECT)
            .await
            .unwrap_or(false)
    }

    // =========================================================================
    // WAITS
    // =========================================================================

    /// Wait until the server has defined a property
    pub async fn wait_for_property(
        &self,
        device: &str,
        property: &str,
        timeout_duration: Duration,
    ) -> IndiResult<()> {
        let start = Instant::now();
        let poll_interval = self.timeout_config.poll_interval();
        while !self.has_property(device, property).await {
            if start.elapsed() >= timeout_duration {
                return Err(IndiError::PropertyNotFound {
                    device: device.to_string(),
                    property: property.to_string(),
                });
            }
            sleep(poll_interval).await;
        }
        Ok(())
    }

    /// Wait for a property to no longer be busy (Ok or Idle state)
    pub async fn wait_for_property_not_busy(
        &self,
        device: &str,
        property: &str,
        timeout_duration: Duration,
    ) -> IndiResult<()> {
        let start = Instant::now();
        let poll_interval = self.timeout_config.poll_interval();
        let mut last_state = None;

        loop {
            if start.elapsed() >= timeout_duration {
                return Err(IndiError::PropertyTimeout {
                    device: device.to_string(),
                    property: property.to_string(),
                    duration: timeout_duration,
                    last_state: last_state.map(|s| format!("{:?}", s)),
                });
            }

            if let Some(state) = self.get_property_state(device, property).await {
                last_state = Some(state);
                match state {
                    IndiPropertyState::Ok | IndiPropertyState::Idle => return Ok(()),
                    IndiPropertyState::Alert => {
                        return Err(IndiError::DeviceAlert(format!(
                            "{}.{} entered Alert state",
                            device, property
                        )));
                    }
                    IndiPropertyState::Busy => {}
                }
            }

            sleep(poll_interval).await;
        }
    }
}

impl Default for IndiClient {
    fn default() -> Self {
        Self::new("localhost", None)
    }
}

// =============================================================================
// READER TASK
// =============================================================================

/// Tracks which vector/element the XML stream is currently inside
#[derive(Default)]
struct ParseContext {
    device: String,
    property: String,
    element: String,
    blob_format: Option<String>,
}

async fn reader_task<R: AsyncRead + Unpin>(
    reader: R,
    properties: Arc<RwLock<PropertyMap>>,
    property_values: Arc<RwLock<PropertyValueMap>>,
    connected: Arc<AtomicBool>,
    event_tx: broadcast::Sender<IndiEvent>,
) {
    let mut reader = quick_xml::reader::Reader::from_reader(tokio::io::BufReader::new(reader));
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut ctx = ParseContext::default();

    loop {
        match reader.read_event_into_async(&mut buf).await {
            Ok(Event::Start(e)) => {
                handle_start(&e, &mut ctx, &properties, &event_tx).await;
            }
            Ok(Event::Empty(e)) => {
                handle_start(&e, &mut ctx, &properties, &event_tx).await;
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name.starts_with("def") && !name.ends_with("Vector") {
                    ctx.element.clear();
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if ctx.device.is_empty() || ctx.property.is_empty() || ctx.element.is_empty() {
                    buf.clear();
                    continue;
                }
                if let Some(format) = ctx.blob_format.take() {
                    match BASE64.decode(text.trim()) {
                        Ok(data) => {
                            tracing::debug!(
                                "BLOB received for {}.{}.{}: {} bytes",
                                ctx.device,
                                ctx.property,
                                ctx.element,
                                data.len()
                            );
                            let _ = event_tx.send(IndiEvent::BlobReceived {
                                device: ctx.device.clone(),
                                property: ctx.property.clone(),
                                element: ctx.element.clone(),
                                data,
                                format,
                            });
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Failed to decode BLOB base64 for {}.{}.{}: {}",
                                ctx.device,
                                ctx.property,
                                ctx.element,
                                e
                            );
                        }
                    }
                } else {
                    property_values.write().await.insert(
                        (ctx.device.clone(), ctx.property.clone(), ctx.element.clone()),
                        text.trim().to_string(),
                    );
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name.ends_with("Vector") {
                    let _ = event_tx.send(IndiEvent::PropertyUpdated(
                        ctx.device.clone(),
                        ctx.property.clone(),
                    ));
                    ctx.property.clear();
                } else if name.starts_with("one") || name.starts_with("def") {
                    ctx.element.clear();
                    ctx.blob_format = None;
                }
            }
            Ok(Event::Eof) => {
                tracing::info!("INDI connection closed (EOF)");
                break;
            }
            Err(e) => {
                tracing::error!(
                    "INDI XML parse error: {}. Raw buffer (first 200 chars): {:?}",
                    e,
                    String::from_utf8_lossy(&buf[..buf.len().min(200)])
                );
                if !connected.load(Ordering::SeqCst) {
                    break;
                }
            }
            _ => {}
        }
        buf.clear();
    }

    connected.store(false, Ordering::SeqCst);
    let _ = event_tx.send(IndiEvent::ConnectionStateChanged(false));
}

async fn handle_start(
    e: &BytesStart<'_>,
    ctx: &mut ParseContext,
    properties: &Arc<RwLock<PropertyMap>>,
    event_tx: &broadcast::Sender<IndiEvent>,
) {
    let name_str = String::from_utf8_lossy(e.name().as_ref()).to_string();

    if name_str.starts_with("def") && name_str.ends_with("Vector") {
        let (Some(dev), Some(prop)) = (get_attribute(e, "device"), get_attribute(e, "name")) else {
            return;
        };
        ctx.device = dev;
        ctx.property = prop;

        let prop_type = if name_str.contains("Switch") {
            IndiPropertyType::Switch
        } else if name_str.contains("Number") {
            IndiPropertyType::Number
        } else if name_str.contains("Light") {
            IndiPropertyType::Light
        } else if name_str.contains("BLOB") {
            IndiPropertyType::Blob
        } else {
            IndiPropertyType::Text
        };
        let state = parse_state(&get_attribute(e, "state").unwrap_or_else(|| "Idle".to_string()));
        let perm = parse_perm(&get_attribute(e, "perm").unwrap_or_else(|| "rw".to_string()));

        properties.write().await.insert(
            (ctx.device.clone(), ctx.property.clone()),
            IndiProperty {
                device: ctx.device.clone(),
                name: ctx.property.clone(),
                property_type: prop_type,
                state,
                perm,
                elements: Vec::new(),
            },
        );
        let _ = event_tx.send(IndiEvent::PropertyDefined(
            ctx.device.clone(),
            ctx.property.clone(),
            prop_type,
        ));
    } else if name_str.starts_with("def") {
        if ctx.device.is_empty() || ctx.property.is_empty() {
            return;
        }
        if let Some(elem_name) = get_attribute(e, "name") {
            let mut props = properties.write().await;
            if let Some(prop) = props.get_mut(&(ctx.device.clone(), ctx.property.clone())) {
                if !prop.elements.contains(&elem_name) {
                    prop.elements.push(elem_name.clone());
                }
            }
            ctx.element = elem_name;
        }
    } else if (name_str.starts_with("set") || name_str.starts_with("new"))
        && name_str.ends_with("Vector")
    {
        let (Some(dev), Some(prop)) = (get_attribute(e, "device"), get_attribute(e, "name")) else {
            return;
        };
        ctx.device = dev;
        ctx.property = prop;
        if let Some(state_str) = get_attribute(e, "state") {
            let mut props = properties.write().await;
            if let Some(p) = props.get_mut(&(ctx.device.clone(), ctx.property.clone())) {
                p.state = parse_state(&state_str);
            }
        }
    } else if name_str == "oneBLOB" {
        if let Some(elem) = get_attribute(e, "name") {
            ctx.element = elem;
        }
        ctx.blob_format = Some(get_attribute(e, "format").unwrap_or_else(|| ".fits".to_string()));
    } else if name_str.starts_with("one") {
        if let Some(elem) = get_attribute(e, "name") {
            ctx.element = elem;
        }
    } else if name_str == "delProperty" {
        if let (Some(dev), Some(prop)) = (get_attribute(e, "device"), get_attribute(e, "name")) {
            properties.write().await.remove(&(dev.clone(), prop.clone()));
            let _ = event_tx.send(IndiEvent::PropertyDeleted(dev, prop));
        }
    }
}

/// Helper to get attribute from XML event
fn get_attribute(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .map(|a| String::from_utf8_lossy(&a.value).to_string())
}

fn parse_state(s: &str) -> IndiPropertyState {
    match s {
        "Idle" => IndiPropertyState::Idle,
        "Ok" => IndiPropertyState::Ok,
        "Busy" => IndiPropertyState::Busy,
        "Alert" => IndiPropertyState::Alert,
        _ => IndiPropertyState::Idle,
    }
}

fn parse_perm(s: &str) -> IndiPermission {
    match s.to_lowercase().as_str() {
        "ro" => IndiPermission::ReadOnly,
        "wo" => IndiPermission::WriteOnly,
        _ => IndiPermission::ReadWrite,
    }
}

/// Parse an INDI number, which may be decimal or sexagesimal ("5:30:00", "-5 30 0")
pub fn parse_indi_number(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<f64>() {
        return Some(v);
    }
    let negative = raw.starts_with('-');
    let mut total = 0.0;
    let mut scale = 1.0;
    let mut parts = 0;
    for part in raw
        .trim_start_matches(['-', '+'])
        .split(|c: char| c == ':' || c.is_whitespace())
        .filter(|p| !p.is_empty())
    {
        let value: f64 = part.parse().ok()?;
        total += value / scale;
        scale *= 60.0;
        parts += 1;
    }
    if parts == 0 || parts > 3 {
        return None;
    }
    Some(if negative { -total } else { total })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn feed(xml: &str) -> (Arc<RwLock<PropertyMap>>, Arc<RwLock<PropertyValueMap>>, Vec<IndiEvent>) {
        let properties = Arc::new(RwLock::new(HashMap::new()));
        let values = Arc::new(RwLock::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (event_tx, mut event_rx) = broadcast::channel(100);
        reader_task(
            xml.as_bytes(),
            properties.clone(),
            values.clone(),
            connected,
            event_tx,
        )
        .await;
        let mut events = Vec::new();
        while let Ok(ev) = event_rx.try_recv() {
            events.push(ev);
        }
        (properties, values, events)
    }

    #[tokio::test]
    async fn test_reader_caches_light_vector_in_order() {
        let xml = r#"<defLightVector device="EQMod Mount" name="RASTATUS" state="Idle">
            <defLight name="RAInitialized">Ok</defLight>
            <defLight name="RARunning">Ok</defLight>
            <defLight name="RAGoto">Busy</defLight>
            <defLight name="RAHighspeed">Busy</defLight>
        </defLightVector>"#;
        let (props, values, _) = feed(xml).await;

        let props = props.read().await;
        let prop = props
            .get(&("EQMod Mount".to_string(), "RASTATUS".to_string()))
            .expect("property defined");
        assert_eq!(prop.property_type, IndiPropertyType::Light);
        assert_eq!(
            prop.elements,
            vec!["RAInitialized", "RARunning", "RAGoto", "RAHighspeed"]
        );
        let values = values.read().await;
        assert_eq!(
            values.get(&(
                "EQMod Mount".to_string(),
                "RASTATUS".to_string(),
                "RAGoto".to_string()
            )),
            Some(&"Busy".to_string())
        );
    }

    #[tokio::test]
    async fn test_reader_applies_set_vector_state_and_values() {
        let xml = r#"<defNumberVector device="Focuser" name="ABS_FOCUS_POSITION" state="Idle" perm="rw">
            <defNumber name="FOCUS_ABSOLUTE_POSITION" min="0" max="100000">5000</defNumber>
        </defNumberVector>
        <setNumberVector device="Focuser" name="ABS_FOCUS_POSITION" state="Busy">
            <oneNumber name="FOCUS_ABSOLUTE_POSITION">5050</oneNumber>
        </setNumberVector>"#;
        let (props, values, events) = feed(xml).await;

        let state = props
            .read()
            .await
            .get(&("Focuser".to_string(), "ABS_FOCUS_POSITION".to_string()))
            .map(|p| p.state);
        assert_eq!(state, Some(IndiPropertyState::Busy));
        assert_eq!(
            values
                .read()
                .await
                .get(&(
                    "Focuser".to_string(),
                    "ABS_FOCUS_POSITION".to_string(),
                    "FOCUS_ABSOLUTE_POSITION".to_string()
                ))
                .cloned(),
            Some("5050".to_string())
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, IndiEvent::PropertyUpdated(d, p) if d == "Focuser" && p == "ABS_FOCUS_POSITION")));
    }

    #[tokio::test]
    async fn test_reader_decodes_blob() {
        let payload = BASE64.encode(b"SIMPLE  =                    T");
        let xml = format!(
            r#"<setBLOBVector device="ZWO CCD" name="CCD1" state="Ok"><oneBLOB name="CCD1" size="30" format=".fits">{}</oneBLOB></setBLOBVector>"#,
            payload
        );
        let (_, values, events) = feed(&xml).await;

        let blob = events.iter().find_map(|e| match e {
            IndiEvent::BlobReceived { data, format, .. } => Some((data.clone(), format.clone())),
            _ => None,
        });
        let (data, format) = blob.expect("blob event");
        assert!(data.starts_with(b"SIMPLE"));
        assert_eq!(format, ".fits");
        assert!(values.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_reader_marks_disconnected_on_eof() {
        let connected = Arc::new(AtomicBool::new(true));
        let (event_tx, _rx) = broadcast::channel(10);
        reader_task(
            &b""[..],
            Arc::new(RwLock::new(HashMap::new())),
            Arc::new(RwLock::new(HashMap::new())),
            connected.clone(),
            event_tx,
        )
        .await;
        assert!(!connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_send_command_requires_connection() {
        let client = IndiClient::default();
        let result = client.send_command("<getProperties/>").await;
        assert!(matches!(result, Err(IndiError::NotConnected)));
    }

    #[test]
    fn test_parse_indi_number() {
        assert_eq!(parse_indi_number("5.5"), Some(5.5));
        assert_eq!(parse_indi_number("5:30:00"), Some(5.5));
        assert_eq!(parse_indi_number("-5:30"), Some(-5.5));
        assert_eq!(parse_indi_number("-0 30 0"), Some(-0.5));
        assert_eq!(parse_indi_number("abc"), None);
        assert_eq!(parse_indi_number(""), None);
    }

    #[test]
    fn test_parse_state_and_perm() {
        assert_eq!(parse_state("Busy"), IndiPropertyState::Busy);
        assert_eq!(parse_state("garbage"), IndiPropertyState::Idle);
        assert_eq!(parse_perm("ro"), IndiPermission::ReadOnly);
        assert_eq!(parse_perm("RW"), IndiPermission::ReadWrite);
    }
}
