//! INDI Mount wrapper
//!
//! Provides high-level telescope mount control via INDI protocol.

use crate::client::IndiClient;
use crate::error::{IndiError, IndiResult};
use crate::protocol::standard_properties::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::sleep;

/// Tolerance for verifying that a sync was accepted (hours / degrees)
const SYNC_TOLERANCE: f64 = 0.001;

/// Side of the pier the optical tube is on, as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndiPierSide {
    East,
    West,
    Unknown,
}

/// INDI Mount device wrapper
pub struct IndiMount {
    client: Arc<RwLock<IndiClient>>,
    device_name: String,
}

impl IndiMount {
    /// Create a new INDI mount wrapper
    pub fn new(client: Arc<RwLock<IndiClient>>, device_name: &str) -> Self {
        Self {
            client,
            device_name: device_name.to_string(),
        }
    }

    /// Get the device name
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Connect to the mount
    pub async fn connect(&self) -> IndiResult<()> {
        let mut client = self.client.write().await;
        client
            .connect_device(&self.device_name, EQUATORIAL_EOD_COORD)
            .await
    }

    /// Get current coordinates of date (RA in hours, Dec in degrees)
    pub async fn get_coordinates(&self) -> IndiResult<(f64, f64)> {
        let client = self.client.read().await;
        let ra = client
            .require_number(&self.device_name, EQUATORIAL_EOD_COORD, RA)
            .await?;
        let dec = client
            .require_number(&self.device_name, EQUATORIAL_EOD_COORD, DEC)
            .await?;
        Ok((ra, dec))
    }

    /// Whether the coordinate property is Busy (a goto is in progress)
    pub async fn is_slewing(&self) -> bool {
        let client = self.client.read().await;
        client
            .is_property_busy(&self.device_name, EQUATORIAL_EOD_COORD)
            .await
    }

    /// Slew to coordinates and keep tracking once there
    pub async fn goto(&self, ra_hours: f64, dec_degrees: f64, timeout: Option<Duration>) -> IndiResult<()> {
        let timeout_duration = match timeout {
            Some(t) => t,
            None => self.client.read().await.timeout_config().mount_slew_timeout(),
        };

        {
            let mut client = self.client.write().await;
            client
                .set_switch(&self.device_name, ON_COORD_SET, TRACK, true)
                .await?;
            client
                .set_numbers(
                    &self.device_name,
                    EQUATORIAL_EOD_COORD,
                    &[(RA, ra_hours), (DEC, dec_degrees)],
                )
                .await?;
        }

        // The driver flips the vector to Busy asynchronously; give it a moment
        sleep(Duration::from_millis(500)).await;

        let client = self.client.read().await;
        client
            .wait_for_property_not_busy(&self.device_name, EQUATORIAL_EOD_COORD, timeout_duration)
            .await
            .map_err(|e| match e {
                IndiError::PropertyTimeout { duration, .. } => IndiError::OperationTimeout {
                    operation: "goto".to_string(),
                    device: self.device_name.clone(),
                    duration,
                    context: format!(
                        "Mount did not reach RA={:.4}h, Dec={:.4}°",
                        ra_hours, dec_degrees
                    ),
                },
                other => other,
            })
    }

    /// Sync the pointing model to coordinates (RA in hours, Dec in degrees)
    pub async fn sync(&self, ra_hours: f64, dec_degrees: f64) -> IndiResult<()> {
        let property_timeout = {
            let mut client = self.client.write().await;
            client
                .set_switch(&self.device_name, TELESCOPE_TRACK_STATE, TRACK_ON, true)
                .await?;
            client
                .set_switch(&self.device_name, ON_COORD_SET, SYNC, true)
                .await?;
            client
                .set_numbers(
                    &self.device_name,
                    EQUATORIAL_EOD_COORD,
                    &[(RA, ra_hours), (DEC, dec_degrees)],
                )
                .await?;
            client.timeout_config().property_timeout()
        };

        sleep(Duration::from_millis(500)).await;
        {
            let client = self.client.read().await;
            client
                .wait_for_property_not_busy(&self.device_name, EQUATORIAL_EOD_COORD, property_timeout)
                .await?;
        }

        let (ra, dec) = self.get_coordinates().await?;
        if (ra - ra_hours).abs() > SYNC_TOLERANCE || (dec - dec_degrees).abs() > SYNC_TOLERANCE {
            tracing::warn!(
                "Sync on {} not reflected in coordinates: requested RA={:.5}h Dec={:.5}°, mount reports RA={:.5}h Dec={:.5}°",
                self.device_name, ra_hours, dec_degrees, ra, dec
            );
        }
        Ok(())
    }

    /// Park the mount and wait until the driver reports it parked
    pub async fn park(&self) -> IndiResult<()> {
        self.set_park_state(PARK).await
    }

    pub async fn unpark(&self) -> IndiResult<()> {
        self.set_park_state(UNPARK).await
    }

    async fn set_park_state(&self, element: &str) -> IndiResult<()> {
        let timeout_duration = {
            let mut client = self.client.write().await;
            client
                .set_switch(&self.device_name, TELESCOPE_PARK, element, true)
                .await?;
            client.timeout_config().mount_park_timeout()
        };

        let start = Instant::now();
        loop {
            {
                let client = self.client.read().await;
                let reached = client
                    .get_switch(&self.device_name, TELESCOPE_PARK, element)
                    .await
                    .unwrap_or(false);
                if reached && !client.is_property_busy(&self.device_name, TELESCOPE_PARK).await {
                    return Ok(());
                }
            }
            if start.elapsed() >= timeout_duration {
                return Err(IndiError::OperationTimeout {
                    operation: element.to_lowercase(),
                    device: self.device_name.clone(),
                    duration: timeout_duration,
                    context: format!("{} switch never reported On", element),
                });
            }
            sleep(Duration::from_millis(500)).await;
        }
    }

    pub async fn is_parked(&self) -> bool {
        let client = self.client.read().await;
        client
            .get_switch(&self.device_name, TELESCOPE_PARK, PARK)
            .await
            .unwrap_or(false)
    }

    /// Tracking switch state, `None` when the driver does not publish it
    pub async fn is_tracking(&self) -> Option<bool> {
        let client = self.client.read().await;
        client
            .get_switch(&self.device_name, TELESCOPE_TRACK_STATE, TRACK_ON)
            .await
    }

    pub async fn get_pier_side(&self) -> IndiPierSide {
        let client = self.client.read().await;
        let east = client
            .get_switch(&self.device_name, TELESCOPE_PIER_SIDE, PIER_EAST)
            .await;
        let west = client
            .get_switch(&self.device_name, TELESCOPE_PIER_SIDE, PIER_WEST)
            .await;
        match (east, west) {
            (Some(true), _) => IndiPierSide::East,
            (_, Some(true)) => IndiPierSide::West,
            _ => IndiPierSide::Unknown,
        }
    }

    /// Local sidereal time in hours, if the driver publishes TIME_LST
    pub async fn get_local_sidereal_time(&self) -> Option<f64> {
        let client = self.client.read().await;
        client.get_number(&self.device_name, TIME_LST, LST).await
    }

    /// Site latitude, longitude (degrees, east positive) and elevation (metres)
    pub async fn get_geographic_coordinates(&self) -> IndiResult<(f64, f64, f64)> {
        let client = self.client.read().await;
        let lat = client
            .require_number(&self.device_name, GEOGRAPHIC_COORD, LAT)
            .await?;
        let lon = client
            .require_number(&self.device_name, GEOGRAPHIC_COORD, LONG)
            .await?;
        let elev = client
            .get_number(&self.device_name, GEOGRAPHIC_COORD, ELEV)
            .await
            .unwrap_or(0.0);
        Ok((lat, lon, elev))
    }

    /// Get horizontal coordinates (Alt/Az in degrees)
    pub async fn get_horizontal_coordinates(&self) -> Option<(f64, f64)> {
        let client = self.client.read().await;
        let alt = client.get_number(&self.device_name, HORIZONTAL_COORD, ALT).await?;
        let az = client.get_number(&self.device_name, HORIZONTAL_COORD, AZ).await?;
        Some((alt, az))
    }

    /// Raw (name, value) drive status lights for one axis (RASTATUS or DESTATUS)
    pub async fn get_axis_status(&self, property: &str) -> Vec<(String, String)> {
        let client = self.client.read().await;
        client
            .get_elements(&self.device_name, property)
            .await
            .unwrap_or_default()
    }
}
