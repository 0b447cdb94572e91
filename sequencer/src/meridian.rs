//! Mount state derivation and meridian flip timing
//!
//! Everything here is a pure function of raw mount readings so it can be
//! exercised without a device. The session feeds one `RawMountStatus` per poll
//! through `MountMonitor`, which turns read failures into an Unknown state and
//! escalates only after a run of them.

use crate::coordinates::{format_dms, format_duration_hms, format_hms, EquatorialCoordinate};
use crate::error::{DeviceResult, SequencerError, SequencerResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the pier the optical tube is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PierSide {
    East,
    West,
    Unknown,
}

impl fmt::Display for PierSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PierSide::East => write!(f, "East"),
            PierSide::West => write!(f, "West"),
            PierSide::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlewKind {
    Manual,
    Goto,
}

/// Classified drive state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Idle,
    ManualSlew,
    GotoSlew,
    Tracking,
    /// The status could not be read; never acted upon
    Unknown,
}

impl MountState {
    pub fn slewing(&self) -> Option<SlewKind> {
        match self {
            MountState::ManualSlew => Some(SlewKind::Manual),
            MountState::GotoSlew => Some(SlewKind::Goto),
            _ => None,
        }
    }
}

/// Everything read from the mount in one poll, already typed by the port
#[derive(Debug, Clone, PartialEq)]
pub struct RawMountStatus {
    /// (light name, state) pairs for the RA drive, e.g. ("RAGoto", "Busy")
    pub ra_axis: Vec<(String, String)>,
    /// (light name, state) pairs for the Dec drive
    pub dec_axis: Vec<(String, String)>,
    pub coordinates: EquatorialCoordinate,
    pub lst_hours: f64,
    pub pier_side: PierSide,
    /// TRACK_ON switch, when the driver publishes it
    pub tracking_switch: Option<bool>,
    /// Whether the coordinate property is mid-goto
    pub coordinates_busy: bool,
}

fn indicator(axis: &[(String, String)], suffix: &str, value: &str) -> bool {
    axis.iter()
        .any(|(name, state)| name.ends_with(suffix) && state.eq_ignore_ascii_case(value))
}

/// Classify per-axis status lights. First matching rule wins.
pub fn classify(ra_axis: &[(String, String)], dec_axis: &[(String, String)]) -> MountState {
    if indicator(ra_axis, "Goto", "Ok") || indicator(dec_axis, "Goto", "Ok") {
        MountState::GotoSlew
    } else if indicator(ra_axis, "Running", "Ok")
        && indicator(ra_axis, "Goto", "Busy")
        && indicator(ra_axis, "Highspeed", "Busy")
    {
        MountState::Tracking
    } else if indicator(ra_axis, "Running", "Ok") || indicator(dec_axis, "Running", "Ok") {
        MountState::ManualSlew
    } else {
        MountState::Idle
    }
}

/// Classify a full poll. Mounts without axis lights fall back to the
/// coordinate busy flag and the tracking switch.
pub fn classify_status(raw: &RawMountStatus) -> MountState {
    if raw.ra_axis.is_empty() && raw.dec_axis.is_empty() {
        if raw.coordinates_busy {
            MountState::GotoSlew
        } else if raw.tracking_switch == Some(true) {
            MountState::Tracking
        } else {
            MountState::Idle
        }
    } else {
        classify(&raw.ra_axis, &raw.dec_axis)
    }
}

/// Hour angle `lst - ra` wrapped to (-12, 12]
pub fn hour_angle(lst_hours: f64, ra_hours: f64) -> f64 {
    let ha = (lst_hours - ra_hours).rem_euclid(24.0);
    if ha > 12.0 {
        ha - 24.0
    } else {
        ha
    }
}

/// Seconds until a meridian flip is required
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlipCountdown {
    pub seconds: f64,
}

impl FlipCountdown {
    pub fn is_due(&self) -> bool {
        self.seconds <= 0.0
    }
}

impl fmt::Display for FlipCountdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_duration_hms(self.seconds))
    }
}

/// Time until the flip for a pier side, hour angle and flip angle (hours past
/// the meridian). An East-side tube has to cross through the other side first.
pub fn time_to_flip(pier_side: PierSide, ha_hours: f64, flip_angle_hours: f64) -> FlipCountdown {
    let seconds = match pier_side {
        PierSide::East => (12.0 + flip_angle_hours - ha_hours) * 3600.0,
        PierSide::West | PierSide::Unknown => ((flip_angle_hours - ha_hours) * 3600.0).max(0.0),
    };
    FlipCountdown { seconds }
}

/// Derived mount status for one poll. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MountStatus {
    pub pier_side: PierSide,
    pub ha_hours: f64,
    pub tracking: bool,
    pub slewing: Option<SlewKind>,
    pub state: MountState,
    pub coordinates: EquatorialCoordinate,
    pub time_to_flip: FlipCountdown,
}

impl MountStatus {
    pub fn derive(raw: &RawMountStatus, flip_angle_hours: f64) -> Self {
        let state = classify_status(raw);
        let ha_hours = hour_angle(raw.lst_hours, raw.coordinates.ra_hours);
        Self {
            pier_side: raw.pier_side,
            ha_hours,
            tracking: state == MountState::Tracking || raw.tracking_switch == Some(true),
            slewing: state.slewing(),
            state,
            coordinates: raw.coordinates,
            time_to_flip: time_to_flip(raw.pier_side, ha_hours, flip_angle_hours),
        }
    }

    /// A flip is only started from a settled mount
    pub fn flip_due(&self) -> bool {
        self.slewing.is_none() && self.time_to_flip.is_due()
    }
}

impl fmt::Display for MountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RA: {} HA: {} DEC: {} | Pier side: {} | Time to flip: {}",
            format_hms(self.coordinates.ra_hours),
            format_hms(self.ha_hours),
            format_dms(self.coordinates.dec_degrees),
            self.pier_side,
            self.time_to_flip
        )
    }
}

/// Turns a stream of status reads into statuses, tolerating a bounded run of
/// unreadable polls
#[derive(Debug, Clone)]
pub struct MountMonitor {
    flip_angle_hours: f64,
    max_consecutive_unknown: u32,
    consecutive_unknown: u32,
    last_state: MountState,
}

impl MountMonitor {
    pub fn new(flip_angle_hours: f64, max_consecutive_unknown: u32) -> Self {
        Self {
            flip_angle_hours,
            max_consecutive_unknown: max_consecutive_unknown.max(1),
            consecutive_unknown: 0,
            last_state: MountState::Unknown,
        }
    }

    pub fn last_state(&self) -> MountState {
        self.last_state
    }

    pub fn consecutive_unknown(&self) -> u32 {
        self.consecutive_unknown
    }

    /// `Ok(None)` means the state is Unknown this poll and nothing should be done
    pub fn observe(&mut self, read: DeviceResult<RawMountStatus>) -> SequencerResult<Option<MountStatus>> {
        match read {
            Ok(raw) => {
                self.consecutive_unknown = 0;
                let status = MountStatus::derive(&raw, self.flip_angle_hours);
                self.last_state = status.state;
                tracing::info!(
                    target: "mount",
                    state = ?status.state,
                    pier_side = %status.pier_side,
                    ha_hours = status.ha_hours,
                    time_to_flip_secs = status.time_to_flip.seconds,
                    "{}",
                    status
                );
                Ok(Some(status))
            }
            Err(e) => {
                self.consecutive_unknown += 1;
                self.last_state = MountState::Unknown;
                tracing::warn!(
                    target: "mount",
                    state = "Unknown",
                    consecutive = self.consecutive_unknown,
                    "Mount status unreadable: {}",
                    e
                );
                if self.consecutive_unknown >= self.max_consecutive_unknown {
                    Err(SequencerError::MountUnresponsive {
                        polls: self.consecutive_unknown,
                    })
                } else {
                    Ok(None)
                }
            }
        }
    }
}
