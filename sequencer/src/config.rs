//! Session configuration file support.
//!
//! A session is described by one TOML file. Every section except `[target]`
//! may be omitted and every field has a default, so a minimal file is just a
//! target and a capture plan.

use crate::coordinates::{parse_sexagesimal, EquatorialCoordinate};
use crate::device_ops::{ExposureRequest, SettleSpec};
use crate::error::{SequencerError, SequencerResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub target: TargetConfig,
    #[serde(default)]
    pub devices: DeviceConfig,
    #[serde(default)]
    pub alignment: AlignmentConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub guiding: GuidingConfig,
    #[serde(default)]
    pub focus: FocusConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub preflight: PreflightConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Target coordinates as decimal or sexagesimal strings (RA in hours)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub ra: String,
    pub dec: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_indi_host")]
    pub indi_host: String,
    #[serde(default = "default_indi_port")]
    pub indi_port: u16,
    #[serde(default = "default_mount")]
    pub mount: String,
    #[serde(default = "default_camera")]
    pub camera: String,
    /// Without a focuser, autofocus is skipped
    #[serde(default = "default_focuser")]
    pub focuser: Option<String>,
    /// Filter wheel device, when it is not built into the camera driver
    #[serde(default)]
    pub filter_wheel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    #[serde(default = "default_align_threshold")]
    pub threshold_arcsec: f64,
    #[serde(default = "default_align_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_align_exposure")]
    pub exposure: f64,
    #[serde(default = "default_luminance")]
    pub filter: String,
    #[serde(default = "default_focus_gain")]
    pub gain: i32,
    #[serde(default = "default_offset")]
    pub offset: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Imaging stops once the target is at or below this altitude
    #[serde(default)]
    pub min_altitude: f64,
    /// Hours past the meridian before flipping
    #[serde(default = "default_flip_angle")]
    pub flip_angle_hours: f64,
    #[serde(default = "default_max_unknown_polls")]
    pub max_unknown_polls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// A guider start failure ends the session instead of imaging unguided
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default = "default_phd2_host")]
    pub host: String,
    #[serde(default = "default_phd2_port")]
    pub port: u16,
    #[serde(default = "default_settle_pixels")]
    pub settle_pixels: f64,
    #[serde(default = "default_settle_time")]
    pub settle_time: f64,
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout: f64,
    /// Overall limit on a guide start, calibration included
    #[serde(default = "default_start_timeout")]
    pub start_timeout: f64,
    #[serde(default = "default_dither_pixels")]
    pub dither_pixels: f64,
    #[serde(default = "default_dither_settle_pixels")]
    pub dither_settle_pixels: f64,
    #[serde(default = "default_dither_settle_time")]
    pub dither_settle_time: f64,
    #[serde(default = "default_settle_timeout")]
    pub dither_settle_timeout: f64,
    /// Images between dithers; 0 disables dithering
    #[serde(default = "default_dither_period")]
    pub dither_period: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// A failed autofocus ends the session
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default = "default_focus_interval")]
    pub interval_minutes: f64,
    #[serde(default = "default_focus_step")]
    pub step: i32,
    #[serde(default = "default_focus_steps_each_side")]
    pub steps_each_side: i32,
    #[serde(default = "default_backlash_margin")]
    pub backlash_margin: i32,
    #[serde(default = "default_luminance")]
    pub filter: String,
    #[serde(default = "default_broadband_exposure")]
    pub broadband_exposure: f64,
    #[serde(default = "default_narrowband_exposure")]
    pub narrowband_exposure: f64,
    #[serde(default = "default_focus_gain")]
    pub gain: i32,
    #[serde(default = "default_offset")]
    pub offset: i32,
    #[serde(default)]
    pub skip_initial: bool,
}

/// One line of the exposure plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub filter: String,
    /// Seconds
    pub exposure: f64,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_capture_gain")]
    pub gain: i32,
    #[serde(default = "default_offset")]
    pub offset: i32,
    /// Passes over the plan; 0 repeats until another stop condition
    #[serde(default = "default_plan_cycles")]
    pub plan_cycles: u32,
    #[serde(default = "default_plan")]
    pub plan: Vec<PlanEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    #[serde(default = "default_min_free_gib")]
    pub min_free_gib: f64,
    #[serde(default = "default_maintenance_horizon")]
    pub maintenance_horizon_hours: f64,
    /// File holding a Rachio API key; no calendar check without it
    #[serde(default)]
    pub rachio_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_astap_path")]
    pub astap_path: PathBuf,
    /// Degrees
    #[serde(default = "default_search_radius")]
    pub search_radius: f64,
    /// Seconds before a running solve is killed
    #[serde(default = "default_solver_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_siril_path")]
    pub siril_path: PathBuf,
    /// Seconds before a running star detection is killed
    #[serde(default = "default_metrics_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_indi_host() -> String {
    "localhost".to_string()
}

fn default_indi_port() -> u16 {
    7624
}

fn default_mount() -> String {
    "ZWO AM5".to_string()
}

fn default_camera() -> String {
    "QHY CCD QHY268M".to_string()
}

fn default_focuser() -> Option<String> {
    Some("ZWO EAF".to_string())
}

fn default_align_threshold() -> f64 {
    20.0
}

fn default_align_iterations() -> u32 {
    10
}

fn default_align_exposure() -> f64 {
    2.0
}

fn default_luminance() -> String {
    "L".to_string()
}

fn default_focus_gain() -> i32 {
    70
}

fn default_offset() -> i32 {
    20
}

fn default_flip_angle() -> f64 {
    0.3
}

fn default_max_unknown_polls() -> u32 {
    5
}

fn default_phd2_host() -> String {
    "localhost".to_string()
}

fn default_phd2_port() -> u16 {
    4400
}

fn default_settle_pixels() -> f64 {
    1.5
}

fn default_settle_time() -> f64 {
    10.0
}

fn default_settle_timeout() -> f64 {
    60.0
}

fn default_start_timeout() -> f64 {
    360.0
}

fn default_dither_pixels() -> f64 {
    4.0
}

fn default_dither_settle_pixels() -> f64 {
    0.5
}

fn default_dither_settle_time() -> f64 {
    8.0
}

fn default_dither_period() -> u32 {
    10
}

fn default_focus_interval() -> f64 {
    60.0
}

fn default_focus_step() -> i32 {
    6
}

fn default_focus_steps_each_side() -> i32 {
    7
}

fn default_backlash_margin() -> i32 {
    50
}

fn default_broadband_exposure() -> f64 {
    2.0
}

fn default_narrowband_exposure() -> f64 {
    4.0
}

fn default_repeat() -> u32 {
    1
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("captures")
}

fn default_capture_gain() -> i32 {
    56
}

fn default_plan_cycles() -> u32 {
    1
}

fn default_plan() -> Vec<PlanEntry> {
    ["L", "R", "G", "B"]
        .iter()
        .map(|filter| PlanEntry {
            filter: filter.to_string(),
            exposure: 300.0,
            repeat: 1,
        })
        .collect()
}

fn default_min_free_gib() -> f64 {
    20.0
}

fn default_maintenance_horizon() -> f64 {
    12.0
}

fn default_astap_path() -> PathBuf {
    PathBuf::from("astap")
}

fn default_search_radius() -> f64 {
    180.0
}

fn default_solver_timeout() -> f64 {
    120.0
}

fn default_siril_path() -> PathBuf {
    PathBuf::from("siril-cli")
}

fn default_metrics_timeout() -> f64 {
    60.0
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    2000
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            indi_host: default_indi_host(),
            indi_port: default_indi_port(),
            mount: default_mount(),
            camera: default_camera(),
            focuser: default_focuser(),
            filter_wheel: None,
        }
    }
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            threshold_arcsec: default_align_threshold(),
            max_iterations: default_align_iterations(),
            exposure: default_align_exposure(),
            filter: default_luminance(),
            gain: default_focus_gain(),
            offset: default_offset(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_altitude: 0.0,
            flip_angle_hours: default_flip_angle(),
            max_unknown_polls: default_max_unknown_polls(),
        }
    }
}

impl Default for GuidingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mandatory: false,
            host: default_phd2_host(),
            port: default_phd2_port(),
            settle_pixels: default_settle_pixels(),
            settle_time: default_settle_time(),
            settle_timeout: default_settle_timeout(),
            start_timeout: default_start_timeout(),
            dither_pixels: default_dither_pixels(),
            dither_settle_pixels: default_dither_settle_pixels(),
            dither_settle_time: default_dither_settle_time(),
            dither_settle_timeout: default_settle_timeout(),
            dither_period: default_dither_period(),
        }
    }
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mandatory: false,
            interval_minutes: default_focus_interval(),
            step: default_focus_step(),
            steps_each_side: default_focus_steps_each_side(),
            backlash_margin: default_backlash_margin(),
            filter: default_luminance(),
            broadband_exposure: default_broadband_exposure(),
            narrowband_exposure: default_narrowband_exposure(),
            gain: default_focus_gain(),
            offset: default_offset(),
            skip_initial: false,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            directory: default_capture_dir(),
            gain: default_capture_gain(),
            offset: default_offset(),
            plan_cycles: default_plan_cycles(),
            plan: default_plan(),
        }
    }
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            min_free_gib: default_min_free_gib(),
            maintenance_horizon_hours: default_maintenance_horizon(),
            rachio_key_file: None,
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            astap_path: default_astap_path(),
            search_radius: default_search_radius(),
            timeout: default_solver_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            siril_path: default_siril_path(),
            timeout: default_metrics_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

/// Narrowband filters (SII, Ha, OIII) need longer focus exposures
pub fn is_narrowband(filter: &str) -> bool {
    matches!(
        filter.chars().next().map(|c| c.to_ascii_uppercase()),
        Some('S') | Some('H') | Some('O')
    )
}

impl TargetConfig {
    pub fn coordinate(&self) -> SequencerResult<EquatorialCoordinate> {
        let ra = parse_sexagesimal(&self.ra)
            .ok_or_else(|| SequencerError::Config(format!("target.ra '{}' is not a coordinate", self.ra)))?;
        let dec = parse_sexagesimal(&self.dec)
            .ok_or_else(|| SequencerError::Config(format!("target.dec '{}' is not a coordinate", self.dec)))?;
        if !(0.0..24.0).contains(&ra) {
            return Err(SequencerError::Config(format!("target.ra {} outside [0,24) hours", ra)));
        }
        EquatorialCoordinate::new(ra, dec)
            .ok_or_else(|| SequencerError::Config(format!("target.dec {} outside [-90,90] degrees", dec)))
    }

    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{} {}", self.ra, self.dec))
    }
}

impl AlignmentConfig {
    pub fn exposure_request(&self) -> ExposureRequest {
        ExposureRequest {
            seconds: self.exposure,
            gain: self.gain,
            offset: self.offset,
        }
    }
}

impl GuidingConfig {
    pub fn settle(&self) -> SettleSpec {
        SettleSpec {
            pixels: self.settle_pixels,
            time_secs: self.settle_time,
            timeout_secs: self.settle_timeout,
        }
    }

    pub fn dither_settle(&self) -> SettleSpec {
        SettleSpec {
            pixels: self.dither_settle_pixels,
            time_secs: self.dither_settle_time,
            timeout_secs: self.dither_settle_timeout,
        }
    }
}

impl SolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(1.0))
    }
}

impl MetricsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(1.0))
    }
}

impl FocusConfig {
    /// Focus frame settings for the focus filter
    pub fn exposure_request(&self) -> ExposureRequest {
        let seconds = if is_narrowband(&self.filter) {
            self.narrowband_exposure
        } else {
            self.broadband_exposure
        };
        ExposureRequest {
            seconds,
            gain: self.gain,
            offset: self.offset,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_minutes.max(0.0) * 60.0)
    }
}

impl CaptureConfig {
    pub fn exposure_request(&self, entry: &PlanEntry) -> ExposureRequest {
        ExposureRequest {
            seconds: entry.exposure,
            gain: self.gain,
            offset: self.offset,
        }
    }
}

impl PreflightConfig {
    pub fn min_free_bytes(&self) -> u64 {
        (self.min_free_gib.max(0.0) * 1024.0 * 1024.0 * 1024.0) as u64
    }

    pub fn maintenance_horizon(&self) -> Duration {
        Duration::from_secs_f64(self.maintenance_horizon_hours.max(0.0) * 3600.0)
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            attempt_timeout: Some(Duration::from_millis(self.read_timeout_ms)),
        }
    }
}

impl SessionConfig {
    /// Load and validate a session file.
    pub fn load<P: AsRef<Path>>(path: P) -> SequencerResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            SequencerError::Config(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> SequencerResult<Self> {
        let config: SessionConfig = toml::from_str(content)
            .map_err(|e| SequencerError::Config(format!("failed to parse session file: {}", e)))?;
        let problems = config.validate();
        if problems.is_empty() {
            Ok(config)
        } else {
            Err(SequencerError::Config(problems.join("; ")))
        }
    }

    /// Replace the target, keeping its name
    pub fn with_target(mut self, target: EquatorialCoordinate) -> Self {
        self.target.ra = format!("{:.6}", target.ra_hours);
        self.target.dec = format!("{:.6}", target.dec_degrees);
        self
    }

    pub fn target_coordinate(&self) -> SequencerResult<EquatorialCoordinate> {
        self.target.coordinate()
    }

    /// Every problem with the configuration, empty when it is usable
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if let Err(e) = self.target.coordinate() {
            problems.push(match e {
                SequencerError::Config(msg) => msg,
                other => other.to_string(),
            });
        }

        if self.alignment.threshold_arcsec <= 0.0 {
            problems.push("alignment.threshold_arcsec must be positive".to_string());
        }
        if self.alignment.max_iterations == 0 {
            problems.push("alignment.max_iterations must be at least 1".to_string());
        }
        if self.alignment.exposure <= 0.0 {
            problems.push("alignment.exposure must be positive".to_string());
        }

        if !(-90.0..=90.0).contains(&self.limits.min_altitude) {
            problems.push("limits.min_altitude must be within [-90,90]".to_string());
        }
        if !(-12.0..=12.0).contains(&self.limits.flip_angle_hours) {
            problems.push("limits.flip_angle_hours must be within [-12,12]".to_string());
        }
        if self.limits.max_unknown_polls == 0 {
            problems.push("limits.max_unknown_polls must be at least 1".to_string());
        }

        if self.guiding.settle_timeout <= 0.0 || self.guiding.dither_settle_timeout <= 0.0 {
            problems.push("guiding settle timeouts must be positive".to_string());
        }

        if self.solver.timeout <= 0.0 {
            problems.push("solver.timeout must be positive".to_string());
        }
        if self.metrics.timeout <= 0.0 {
            problems.push("metrics.timeout must be positive".to_string());
        }

        if self.focus.step <= 0 {
            problems.push("focus.step must be positive".to_string());
        }
        if self.focus.steps_each_side <= 0 {
            problems.push("focus.steps_each_side must be positive".to_string());
        }
        if self.focus.backlash_margin < 0 {
            problems.push("focus.backlash_margin must not be negative".to_string());
        }
        if self.focus.interval_minutes <= 0.0 {
            problems.push("focus.interval_minutes must be positive".to_string());
        }

        if self.capture.plan.is_empty() {
            problems.push("capture.plan is empty".to_string());
        }
        for (i, entry) in self.capture.plan.iter().enumerate() {
            if entry.filter.trim().is_empty() {
                problems.push(format!("capture.plan[{}] has no filter", i));
            }
            if entry.exposure <= 0.0 {
                problems.push(format!("capture.plan[{}] exposure must be positive", i));
            }
            if entry.repeat == 0 {
                problems.push(format!("capture.plan[{}] repeat must be at least 1", i));
            }
        }

        if self.preflight.min_free_gib < 0.0 {
            problems.push("preflight.min_free_gib must not be negative".to_string());
        }
        if self.retry.attempts == 0 {
            problems.push("retry.attempts must be at least 1".to_string());
        }

        problems
    }
}
