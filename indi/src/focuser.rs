//! INDI Focuser wrapper
//!
//! Provides high-level focuser control via INDI protocol.

use crate::client::IndiClient;
use crate::error::{IndiError, IndiResult};
use crate::protocol::standard_properties::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::sleep;

/// Positions within this many steps of the target count as arrived
pub const DEFAULT_POSITION_TOLERANCE: i32 = 5;

/// INDI Focuser device wrapper
pub struct IndiFocuser {
    client: Arc<RwLock<IndiClient>>,
    device_name: String,
}

impl IndiFocuser {
    /// Create a new INDI focuser wrapper
    pub fn new(client: Arc<RwLock<IndiClient>>, device_name: &str) -> Self {
        Self {
            client,
            device_name: device_name.to_string(),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub async fn connect(&self) -> IndiResult<()> {
        let mut client = self.client.write().await;
        client
            .connect_device(&self.device_name, ABS_FOCUS_POSITION)
            .await
    }

    /// Current absolute position
    pub async fn get_position(&self) -> IndiResult<i32> {
        let client = self.client.read().await;
        let position = client
            .require_number(&self.device_name, ABS_FOCUS_POSITION, FOCUS_ABSOLUTE_POSITION)
            .await?;
        Ok(position.round() as i32)
    }

    /// Move to an absolute position and poll until the reported position is within
    /// `tolerance` steps of it
    pub async fn move_to_with_timeout(
        &self,
        position: i32,
        tolerance: i32,
        timeout: Option<Duration>,
    ) -> IndiResult<()> {
        let timeout_duration = match timeout {
            Some(t) => t,
            None => self.client.read().await.timeout_config().focuser_move_timeout(),
        };

        {
            let mut client = self.client.write().await;
            client
                .set_number(
                    &self.device_name,
                    ABS_FOCUS_POSITION,
                    FOCUS_ABSOLUTE_POSITION,
                    position as f64,
                )
                .await?;
        }

        let start = Instant::now();
        let mut last_position = None;
        loop {
            sleep(Duration::from_millis(500)).await;
            match self.get_position().await {
                Ok(current) => {
                    last_position = Some(current);
                    let busy = self
                        .client
                        .read()
                        .await
                        .is_property_busy(&self.device_name, ABS_FOCUS_POSITION)
                        .await;
                    if (current - position).abs() <= tolerance && !busy {
                        return Ok(());
                    }
                }
                Err(e) => tracing::debug!("Focuser position read failed during move: {}", e),
            }

            if start.elapsed() >= timeout_duration {
                return Err(IndiError::OperationTimeout {
                    operation: "focuser move".to_string(),
                    device: self.device_name.clone(),
                    duration: timeout_duration,
                    context: format!(
                        "target {} not reached, last reported position {:?}",
                        position, last_position
                    ),
                });
            }
        }
    }
}
