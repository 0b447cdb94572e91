//! Imaging Session Sequencer
//!
//! The session core for unattended imaging: typed device ports, the mount
//! state machine and meridian flip timing, closed-loop alignment, parabolic
//! autofocus and the session executor that sequences them.
//!
//! Nothing in this crate talks to hardware directly. Every device and external
//! tool is reached through the traits in [`device_ops`] and [`preflight`].

pub mod alignment;
pub mod autofocus;
pub mod config;
pub mod coordinates;
pub mod device_ops;
pub mod error;
pub mod executor;
pub mod frames;
pub mod meridian;
pub mod preflight;
pub mod retry;
pub mod shutdown;

#[cfg(test)]
mod testing;

pub use alignment::{align, pointing_error_arcsec, AlignmentIteration, AlignmentReport, AlignmentSettings};
pub use autofocus::{autofocus, fit_parabola, AutofocusResult, AutofocusSettings, FocusFit, FocusSample};
pub use config::SessionConfig;
pub use coordinates::EquatorialCoordinate;
pub use device_ops::{
    Autoguider, CameraPort, ExposureRequest, FocuserPort, MountPort, PlateSolver, SettleSpec,
    StarMeasurement, StarMetrics,
};
pub use error::{DeviceError, DeviceResult, SequencerError, SequencerResult};
pub use executor::{SessionExecutor, SessionPhase, SessionPorts, SessionState, SessionSummary, TerminationReason};
pub use meridian::{MountMonitor, MountState, MountStatus, PierSide, RawMountStatus};
pub use preflight::{DiskSpaceProbe, MaintenanceCalendar, MaintenanceEvent, OperatorPrompt};
pub use retry::{retry_transient, RetryPolicy};
pub use shutdown::ShutdownToken;
