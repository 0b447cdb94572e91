//! INDI Protocol Client
//!
//! Talks to an INDI server over TCP and exposes typed wrappers for the
//! devices an imaging session drives: mount, focuser and camera (with an
//! optional separate filter wheel device).
//!
//! ## Features
//!
//! - Property cache fed by a background XML reader task
//! - Permission checking before property writes
//! - BLOB reception with base64 decoding, broadcast as events
//! - Busy-state polling with bounded timeouts

mod client;
mod protocol;
mod error;
mod camera;
mod mount;
mod focuser;

pub use client::*;
pub use error::{IndiError, IndiResult};
pub use protocol::{standard_properties, INDI_PROTOCOL_VERSION};
pub use camera::IndiCamera;
pub use mount::{IndiMount, IndiPierSide};
pub use focuser::IndiFocuser;

use std::time::Duration;

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// INDI property types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndiPropertyType {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndiPropertyState {
    Idle,
    Ok,
    Busy,
    Alert,
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndiPermission {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// An INDI property definition as last reported by the server
#[derive(Debug, Clone)]
pub struct IndiProperty {
    pub device: String,
    pub name: String,
    pub property_type: IndiPropertyType,
    pub state: IndiPropertyState,
    pub perm: IndiPermission,
    /// Element names in definition order
    pub elements: Vec<String>,
}

/// Timeout configuration for INDI operations
#[derive(Debug, Clone)]
pub struct IndiTimeoutConfig {
    /// Connection timeout for initial TCP connection (default: 30 seconds)
    pub connection_timeout_secs: u64,
    /// Timeout for receiving BLOB data after an exposure ends (default: 60 seconds)
    pub camera_exposure_buffer_secs: u64,
    /// Timeout for property responses (default: 30 seconds)
    pub property_timeout_secs: u64,
    /// Mount slew timeout (default: 300 seconds)
    pub mount_slew_timeout_secs: u64,
    /// Mount park timeout (default: 180 seconds)
    pub mount_park_timeout_secs: u64,
    /// Focuser move timeout (default: 30 seconds)
    pub focuser_move_timeout_secs: u64,
    /// Filter change timeout (default: 60 seconds)
    pub filter_change_timeout_secs: u64,
    /// Property state polling interval (default: 500ms)
    pub property_poll_interval_ms: u64,
}

impl Default for IndiTimeoutConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
            camera_exposure_buffer_secs: 60,
            property_timeout_secs: 30,
            mount_slew_timeout_secs: 300,
            mount_park_timeout_secs: 180,
            focuser_move_timeout_secs: 30,
            filter_change_timeout_secs: 60,
            property_poll_interval_ms: 500,
        }
    }
}

impl IndiTimeoutConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn property_timeout(&self) -> Duration {
        Duration::from_secs(self.property_timeout_secs)
    }

    pub fn mount_slew_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_slew_timeout_secs)
    }

    pub fn mount_park_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_park_timeout_secs)
    }

    pub fn focuser_move_timeout(&self) -> Duration {
        Duration::from_secs(self.focuser_move_timeout_secs)
    }

    pub fn filter_change_timeout(&self) -> Duration {
        Duration::from_secs(self.filter_change_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.property_poll_interval_ms)
    }

    /// Total time allowed for an exposure of `exposure_secs` to arrive as a BLOB
    pub fn exposure_timeout(&self, exposure_secs: f64) -> Duration {
        Duration::from_secs_f64(exposure_secs.max(0.0)) + Duration::from_secs(self.camera_exposure_buffer_secs)
    }
}
