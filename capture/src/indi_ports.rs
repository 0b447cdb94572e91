//! Sequencer device ports backed by INDI devices
//!
//! Reads are retried on transient failures; motion and exposure commands run
//! once and report their failure to the session, which decides what to do.

use async_trait::async_trait;
use skywatch_indi::standard_properties::{DESTATUS, RASTATUS};
use skywatch_indi::{IndiCamera, IndiError, IndiFocuser, IndiMount, IndiPierSide};
use skywatch_sequencer::coordinates::{altitude_degrees, julian_day, local_sidereal_time};
use skywatch_sequencer::meridian::hour_angle;
use skywatch_sequencer::{
    retry_transient, CameraPort, DeviceError, DeviceResult, EquatorialCoordinate, ExposureRequest,
    FocuserPort, MountPort, PierSide, RawMountStatus, RetryPolicy,
};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Focuser arrival tolerance in steps
const FOCUSER_TOLERANCE: i32 = 2;

/// Translate an INDI failure into the port error taxonomy
pub fn device_error(operation: &str, err: IndiError) -> DeviceError {
    if let Some(duration) = err.timeout_duration() {
        return DeviceError::timeout(operation, duration);
    }
    match err {
        IndiError::DeviceAlert(msg) | IndiError::PermissionDenied(msg) => {
            DeviceError::rejected(operation, msg)
        }
        IndiError::NotConnected => DeviceError::Disconnected("INDI server".to_string()),
        IndiError::ChannelClosed(msg) | IndiError::ConnectionFailed(msg) => {
            DeviceError::Disconnected(msg)
        }
        // anything else the client expects to clear up, e.g. a property the
        // driver has not published yet
        other if other.is_transient() => DeviceError::Busy(format!("{}: {}", operation, other)),
        other => DeviceError::tool("INDI", other.to_string()),
    }
}

fn coordinate(ra_hours: f64, dec_degrees: f64, operation: &str) -> DeviceResult<EquatorialCoordinate> {
    EquatorialCoordinate::new(ra_hours, dec_degrees).ok_or_else(|| {
        DeviceError::tool(
            "INDI",
            format!("{} returned invalid coordinates RA={} Dec={}", operation, ra_hours, dec_degrees),
        )
    })
}

// =============================================================================
// MOUNT
// =============================================================================

pub struct IndiMountPort {
    mount: IndiMount,
    policy: RetryPolicy,
}

impl IndiMountPort {
    pub fn new(mount: IndiMount, policy: RetryPolicy) -> Self {
        Self { mount, policy }
    }

    /// Site latitude and longitude in degrees
    async fn site(&self) -> DeviceResult<(f64, f64)> {
        retry_transient(&self.policy, "read site", || async {
            let (lat, lon, _) = self
                .mount
                .get_geographic_coordinates()
                .await
                .map_err(|e| device_error("read site", e))?;
            Ok::<_, DeviceError>((lat, lon))
        })
        .await
    }

    async fn local_sidereal_time(&self) -> DeviceResult<f64> {
        if let Some(lst) = self.mount.get_local_sidereal_time().await {
            return Ok(lst);
        }
        let (_, lon) = self.site().await?;
        Ok(local_sidereal_time(julian_day(&chrono::Utc::now()), lon))
    }
}

#[async_trait]
impl MountPort for IndiMountPort {
    async fn coordinates(&self) -> DeviceResult<EquatorialCoordinate> {
        retry_transient(&self.policy, "read coordinates", || async {
            let (ra, dec) = self
                .mount
                .get_coordinates()
                .await
                .map_err(|e| device_error("read coordinates", e))?;
            coordinate(ra, dec, "read coordinates")
        })
        .await
    }

    async fn goto(&self, target: &EquatorialCoordinate) -> DeviceResult<()> {
        tracing::info!(target: "mount", "Slewing {} to {}", self.mount.device_name(), target);
        self.mount
            .goto(target.ra_hours, target.dec_degrees, None)
            .await
            .map_err(|e| device_error("goto", e))
    }

    async fn sync(&self, position: &EquatorialCoordinate) -> DeviceResult<()> {
        tracing::info!(target: "mount", "Syncing {} to {}", self.mount.device_name(), position);
        self.mount
            .sync(position.ra_hours, position.dec_degrees)
            .await
            .map_err(|e| device_error("sync", e))
    }

    async fn status(&self) -> DeviceResult<RawMountStatus> {
        let coordinates = self.coordinates().await?;
        let lst_hours = self.local_sidereal_time().await?;
        let pier_side = match self.mount.get_pier_side().await {
            IndiPierSide::East => PierSide::East,
            IndiPierSide::West => PierSide::West,
            IndiPierSide::Unknown => PierSide::Unknown,
        };
        Ok(RawMountStatus {
            ra_axis: self.mount.get_axis_status(RASTATUS).await,
            dec_axis: self.mount.get_axis_status(DESTATUS).await,
            coordinates,
            lst_hours,
            pier_side,
            tracking_switch: self.mount.is_tracking().await,
            coordinates_busy: self.mount.is_slewing().await,
        })
    }

    async fn altitude(&self) -> DeviceResult<f64> {
        if let Some((alt, _)) = self.mount.get_horizontal_coordinates().await {
            return Ok(alt);
        }
        let position = self.coordinates().await?;
        let (lat, lon) = self.site().await?;
        let lst = local_sidereal_time(julian_day(&chrono::Utc::now()), lon);
        Ok(altitude_degrees(
            hour_angle(lst, position.ra_hours),
            position.dec_degrees,
            lat,
        ))
    }

    async fn park(&self) -> DeviceResult<()> {
        tracing::info!(target: "mount", "Parking {}", self.mount.device_name());
        self.mount.park().await.map_err(|e| device_error("park", e))
    }

    async fn unpark(&self) -> DeviceResult<()> {
        tracing::info!(target: "mount", "Unparking {}", self.mount.device_name());
        self.mount.unpark().await.map_err(|e| device_error("unpark", e))
    }
}

// =============================================================================
// FOCUSER
// =============================================================================

pub struct IndiFocuserPort {
    focuser: IndiFocuser,
    policy: RetryPolicy,
}

impl IndiFocuserPort {
    pub fn new(focuser: IndiFocuser, policy: RetryPolicy) -> Self {
        Self { focuser, policy }
    }
}

#[async_trait]
impl FocuserPort for IndiFocuserPort {
    async fn position(&self) -> DeviceResult<i32> {
        retry_transient(&self.policy, "read focuser position", || async {
            self.focuser
                .get_position()
                .await
                .map_err(|e| device_error("read focuser position", e))
        })
        .await
    }

    async fn move_to(&self, position: i32) -> DeviceResult<()> {
        tracing::debug!(target: "focuser", "Moving {} to {}", self.focuser.device_name(), position);
        self.focuser
            .move_to_with_timeout(position, FOCUSER_TOLERANCE, None)
            .await
            .map_err(|e| device_error(&format!("focuser move to {}", position), e))
    }
}

// =============================================================================
// CAMERA
// =============================================================================

/// Gain and offset last written to the camera, to skip redundant writes
#[derive(Debug, Default)]
struct CameraSettings {
    gain: Option<i32>,
    offset: Option<i32>,
}

pub struct IndiCameraPort {
    camera: IndiCamera,
    settings: Mutex<CameraSettings>,
}

impl IndiCameraPort {
    pub fn new(camera: IndiCamera) -> Self {
        Self {
            camera,
            settings: Mutex::new(CameraSettings::default()),
        }
    }

    async fn apply_settings(&self, request: &ExposureRequest) -> DeviceResult<()> {
        let mut settings = self.settings.lock().await;
        if settings.gain != Some(request.gain) {
            self.camera
                .set_gain(request.gain)
                .await
                .map_err(|e| device_error("set gain", e))?;
            settings.gain = Some(request.gain);
        }
        if settings.offset != Some(request.offset) {
            self.camera
                .set_offset(request.offset)
                .await
                .map_err(|e| device_error("set offset", e))?;
            settings.offset = Some(request.offset);
        }
        Ok(())
    }
}

#[async_trait]
impl CameraPort for IndiCameraPort {
    async fn change_filter(&self, filter: &str) -> DeviceResult<()> {
        tracing::info!(target: "camera", "Selecting filter {}", filter);
        self.camera
            .change_filter(filter)
            .await
            .map_err(|e| device_error(&format!("change filter to {}", filter), e))
    }

    async fn capture(&self, request: &ExposureRequest, output: &Path) -> DeviceResult<PathBuf> {
        self.apply_settings(request).await?;
        let sensor = match self.camera.get_temperature().await {
            Some(t) => format!("{:.1}°C", t),
            None => "n/a".to_string(),
        };
        tracing::debug!(
            target: "camera",
            "Exposing {:.1}s gain {} offset {} sensor {} -> {}",
            request.seconds,
            request.gain,
            request.offset,
            sensor,
            output.display()
        );
        self.camera
            .capture_to_file(request.seconds, output)
            .await
            .map_err(|e| device_error(&format!("{:.1}s exposure", request.seconds), e))
    }
}
