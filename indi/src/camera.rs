//! INDI Camera wrapper
//!
//! Exposure capture to FITS files, gain/offset, and filter selection. Cameras
//! with an integrated filter wheel publish FILTER_SLOT on the camera device
//! itself, so the filter device defaults to the camera.

use crate::client::{IndiClient, IndiEvent};
use crate::error::{IndiError, IndiResult};
use crate::protocol::standard_properties::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::time::sleep;

/// INDI Camera device wrapper
pub struct IndiCamera {
    client: Arc<RwLock<IndiClient>>,
    device_name: String,
    filter_device: String,
}

impl IndiCamera {
    /// Create a new INDI camera wrapper
    pub fn new(client: Arc<RwLock<IndiClient>>, device_name: &str) -> Self {
        Self {
            client,
            device_name: device_name.to_string(),
            filter_device: device_name.to_string(),
        }
    }

    /// Use a separate filter wheel device instead of the camera's own
    pub fn with_filter_device(mut self, filter_device: &str) -> Self {
        self.filter_device = filter_device.to_string();
        self
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub async fn connect(&self) -> IndiResult<()> {
        let mut client = self.client.write().await;
        client.connect_device(&self.device_name, CCD_EXPOSURE).await?;
        if self.filter_device != self.device_name {
            client.connect_device(&self.filter_device, FILTER_SLOT).await?;
        }
        Ok(())
    }

    /// Ask the server to send image BLOBs alongside regular properties
    pub async fn enable_blob(&self) -> IndiResult<()> {
        let mut client = self.client.write().await;
        client.enable_blob(&self.device_name).await
    }

    pub async fn set_gain(&self, gain: i32) -> IndiResult<()> {
        let mut client = self.client.write().await;
        client
            .set_number(&self.device_name, CCD_GAIN, GAIN, gain as f64)
            .await
    }

    pub async fn set_offset(&self, offset: i32) -> IndiResult<()> {
        let mut client = self.client.write().await;
        client
            .set_number(&self.device_name, CCD_OFFSET, OFFSET, offset as f64)
            .await
    }

    pub async fn get_temperature(&self) -> Option<f64> {
        let client = self.client.read().await;
        client
            .get_number(&self.device_name, CCD_TEMPERATURE, CCD_TEMPERATURE_VALUE)
            .await
    }

    /// Expose for `duration_secs`, wait for the image BLOB and write it to `output`
    pub async fn capture_to_file(&self, duration_secs: f64, output: &Path) -> IndiResult<PathBuf> {
        // Subscribe before starting the exposure so the BLOB cannot be missed
        let (mut rx, timeout) = {
            let client = self.client.read().await;
            (
                client.subscribe(),
                client.timeout_config().exposure_timeout(duration_secs),
            )
        };

        {
            let mut client = self.client.write().await;
            client
                .set_number(&self.device_name, CCD_EXPOSURE, CCD_EXPOSURE_VALUE, duration_secs)
                .await?;
        }

        let start_time = Instant::now();
        let data = loop {
            if start_time.elapsed() > timeout {
                return Err(IndiError::BlobTimeout {
                    device: self.device_name.clone(),
                    duration: timeout,
                });
            }

            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Ok(IndiEvent::BlobReceived {
                    device,
                    property,
                    data,
                    ..
                })) if device == self.device_name && property == CCD1 => break data,
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!(
                        "INDI event receiver for '{}' lagged by {} events",
                        self.device_name,
                        skipped
                    );
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(IndiError::ChannelClosed(format!(
                        "Event channel closed while waiting for image from '{}'",
                        self.device_name
                    )));
                }
                Err(_) => continue,
            }
        };

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, &data).await?;
        tracing::debug!("Wrote {} bytes to {}", data.len(), output.display());
        Ok(output.to_path_buf())
    }

    /// Filter names in slot order (slot 1 first)
    pub async fn get_filter_names(&self) -> IndiResult<Vec<String>> {
        let client = self.client.read().await;
        let elements = client
            .get_elements(&self.filter_device, FILTER_NAME)
            .await
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: self.filter_device.clone(),
                property: FILTER_NAME.to_string(),
            })?;
        Ok(elements.into_iter().map(|(_, name)| name).collect())
    }

    /// Current filter slot (1-based)
    pub async fn get_filter_slot(&self) -> IndiResult<i32> {
        let client = self.client.read().await;
        let slot = client
            .require_number(&self.filter_device, FILTER_SLOT, FILTER_SLOT_VALUE)
            .await?;
        Ok(slot.round() as i32)
    }

    /// Select a filter by name and wait until the wheel reports that slot
    pub async fn change_filter(&self, name: &str) -> IndiResult<()> {
        let names = self.get_filter_names().await?;
        let slot = names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .map(|i| i as i32 + 1)
            .ok_or_else(|| IndiError::InvalidValue {
                device: self.filter_device.clone(),
                property: FILTER_NAME.to_string(),
                element: "filter".to_string(),
                value: name.to_string(),
            })?;

        if self.get_filter_slot().await.ok() == Some(slot) {
            return Ok(());
        }

        let timeout_duration = {
            let mut client = self.client.write().await;
            client
                .set_number(&self.filter_device, FILTER_SLOT, FILTER_SLOT_VALUE, slot as f64)
                .await?;
            client.timeout_config().filter_change_timeout()
        };

        let start = Instant::now();
        loop {
            sleep(Duration::from_millis(500)).await;
            let busy = self
                .client
                .read()
                .await
                .is_property_busy(&self.filter_device, FILTER_SLOT)
                .await;
            if !busy && self.get_filter_slot().await.ok() == Some(slot) {
                tracing::info!("Filter changed to {} (slot {})", name, slot);
                return Ok(());
            }
            if start.elapsed() >= timeout_duration {
                return Err(IndiError::OperationTimeout {
                    operation: "filter change".to_string(),
                    device: self.filter_device.clone(),
                    duration: timeout_duration,
                    context: format!("slot {} ({}) not reached", slot, name),
                });
            }
        }
    }
}
