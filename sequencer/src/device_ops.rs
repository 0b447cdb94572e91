//! Device Port Traits
//!
//! The interfaces the session algorithms drive. Concrete implementations
//! (INDI devices, PHD2, ASTAP, Siril) live in the capture binary; the
//! algorithms only ever see these traits and already-typed values.

use crate::coordinates::EquatorialCoordinate;
use crate::error::DeviceResult;
use crate::meridian::RawMountStatus;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Settings for one camera exposure
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRequest {
    pub seconds: f64,
    pub gain: i32,
    pub offset: i32,
}

/// Star detection result for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StarMeasurement {
    pub star_count: u32,
    /// Mean FWHM in pixels
    pub fwhm: f64,
}

/// Guider settle criteria: error below `pixels` for `time_secs`, giving up after `timeout_secs`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettleSpec {
    pub pixels: f64,
    pub time_secs: f64,
    pub timeout_secs: f64,
}

// =============================================================================
// MOUNT
// =============================================================================

#[async_trait]
pub trait MountPort: Send + Sync {
    /// Current pointing, epoch of date
    async fn coordinates(&self) -> DeviceResult<EquatorialCoordinate>;

    /// Slew to a coordinate and wait until the slew has finished
    async fn goto(&self, target: &EquatorialCoordinate) -> DeviceResult<()>;

    /// Tell the mount it is pointing at `position`
    async fn sync(&self, position: &EquatorialCoordinate) -> DeviceResult<()>;

    /// One poll of everything the state machine needs
    async fn status(&self) -> DeviceResult<RawMountStatus>;

    /// Altitude of the current pointing in degrees
    async fn altitude(&self) -> DeviceResult<f64>;

    async fn park(&self) -> DeviceResult<()>;

    async fn unpark(&self) -> DeviceResult<()>;
}

// =============================================================================
// FOCUSER
// =============================================================================

#[async_trait]
pub trait FocuserPort: Send + Sync {
    async fn position(&self) -> DeviceResult<i32>;

    /// Move to an absolute position and wait for arrival
    async fn move_to(&self, position: i32) -> DeviceResult<()>;
}

// =============================================================================
// CAMERA
// =============================================================================

#[async_trait]
pub trait CameraPort: Send + Sync {
    /// Select a filter by name and wait for the wheel to settle
    async fn change_filter(&self, filter: &str) -> DeviceResult<()>;

    /// Expose and write the frame to `output`, returning the written path
    async fn capture(&self, request: &ExposureRequest, output: &Path) -> DeviceResult<PathBuf>;
}

// =============================================================================
// MEASUREMENT SERVICES
// =============================================================================

#[async_trait]
pub trait PlateSolver: Send + Sync {
    /// Solve an image; the result is in the mount's epoch (of date)
    async fn solve(&self, image: &Path) -> DeviceResult<EquatorialCoordinate>;
}

#[async_trait]
pub trait StarMetrics: Send + Sync {
    /// Detect stars; `DeviceError::NoStarsFound` when the frame has none
    async fn measure(&self, image: &Path) -> DeviceResult<StarMeasurement>;
}

#[async_trait]
pub trait Autoguider: Send + Sync {
    /// Start guiding and wait for the settle confirmation
    async fn start(&self, settle: &SettleSpec) -> DeviceResult<()>;

    /// Stop guiding (the guider keeps looping exposures)
    async fn stop(&self) -> DeviceResult<()>;

    /// Offset the guide star by up to `pixels` and wait for settle
    async fn dither(&self, pixels: f64, settle: &SettleSpec) -> DeviceResult<()>;
}

pub type SharedMount = Arc<dyn MountPort>;
pub type SharedFocuser = Arc<dyn FocuserPort>;
pub type SharedCamera = Arc<dyn CameraPort>;
pub type SharedSolver = Arc<dyn PlateSolver>;
pub type SharedStarMetrics = Arc<dyn StarMetrics>;
pub type SharedGuider = Arc<dyn Autoguider>;
