//! Session execution engine
//!
//! One sequential control loop per mount. Device commands are only issued from
//! here, one at a time; the only suspension points are device calls and the
//! exposure wait, and termination is only looked at between them.

use crate::alignment::{align, AlignmentSettings};
use crate::autofocus::{autofocus, AutofocusSettings};
use crate::config::{PlanEntry, SessionConfig};
use crate::coordinates::EquatorialCoordinate;
use crate::device_ops::{
    SharedCamera, SharedFocuser, SharedGuider, SharedMount, SharedSolver, SharedStarMetrics,
};
use crate::error::{DeviceError, SequencerError, SequencerResult};
use crate::frames::next_capture_path;
use crate::meridian::MountMonitor;
use crate::preflight::{run_preflight, DiskSpaceProbe, MaintenanceCalendar, OperatorPrompt, PreflightPorts};
use crate::shutdown::ShutdownToken;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Intermediate goto offset used to force the drive through the flip
const FLIP_INTERMEDIATE_RA_HOURS: f64 = 3.0;

/// Flip attempts before a flip that stays due is fatal
const MAX_FLIP_ATTEMPTS: u32 = 2;

/// Exposure progress: percent complete and a human-readable line
pub type ProgressCallback = Box<dyn Fn(f64, String) + Send + Sync>;

/// Every collaborator the session drives
#[derive(Clone)]
pub struct SessionPorts {
    pub mount: SharedMount,
    pub camera: SharedCamera,
    pub solver: SharedSolver,
    pub metrics: SharedStarMetrics,
    pub focuser: Option<SharedFocuser>,
    pub guider: Option<SharedGuider>,
    pub disk: Arc<dyn DiskSpaceProbe>,
    pub calendar: Option<Arc<dyn MaintenanceCalendar>>,
    pub prompt: Arc<dyn OperatorPrompt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Initializing,
    Aligning,
    Guiding,
    Imaging,
    Flipping,
    Focusing,
    Parking,
    Terminated,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Initializing => "Initializing",
            SessionPhase::Aligning => "Aligning",
            SessionPhase::Guiding => "Guiding",
            SessionPhase::Imaging => "Imaging",
            SessionPhase::Flipping => "Flipping",
            SessionPhase::Focusing => "Focusing",
            SessionPhase::Parking => "Parking",
            SessionPhase::Terminated => "Terminated",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    PlanComplete,
    OperatorStop,
    AltitudeLimit,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::PlanComplete => write!(f, "plan complete"),
            TerminationReason::OperatorStop => write!(f, "stopped by operator"),
            TerminationReason::AltitudeLimit => write!(f, "altitude limit reached"),
        }
    }
}

/// Mutable run state, owned by the executor alone
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub images_captured: u32,
    pub images_since_dither: u32,
    pub last_focus_time: Option<Instant>,
    pub last_good_focus: Option<i32>,
    pub current_altitude: Option<f64>,
    pub guiding: bool,
    pub unparked: bool,
    pub flips: u32,
    pub focus_runs: u32,
    flip_attempts: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Initializing,
            images_captured: 0,
            images_since_dither: 0,
            last_focus_time: None,
            last_good_focus: None,
            current_altitude: None,
            guiding: false,
            unparked: false,
            flips: 0,
            focus_runs: 0,
            flip_attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub reason: TerminationReason,
    pub images_captured: u32,
    pub flips: u32,
    pub focus_runs: u32,
    pub elapsed: Duration,
}

/// What the pre-exposure checks decided
enum Gate {
    Capture,
    Stop(TerminationReason),
}

/// Capture directory for a session: the configured root plus the target label
pub fn capture_directory(config: &SessionConfig) -> PathBuf {
    let label: String = config
        .target
        .label()
        .chars()
        .map(|c| if c.is_whitespace() || c == '/' { '_' } else { c })
        .collect();
    config.capture.directory.join(label)
}

pub struct SessionExecutor {
    config: SessionConfig,
    ports: SessionPorts,
    shutdown: ShutdownToken,
    target: EquatorialCoordinate,
    capture_dir: PathBuf,
    state: SessionState,
    monitor: MountMonitor,
    progress_callback: Option<ProgressCallback>,
}

impl SessionExecutor {
    pub fn new(config: SessionConfig, ports: SessionPorts, shutdown: ShutdownToken) -> SequencerResult<Self> {
        let target = config.target_coordinate()?;
        let capture_dir = capture_directory(&config);
        let monitor = MountMonitor::new(config.limits.flip_angle_hours, config.limits.max_unknown_polls);
        Ok(Self {
            config,
            ports,
            shutdown,
            target,
            capture_dir,
            state: SessionState::default(),
            monitor,
            progress_callback: None,
        })
    }

    pub fn with_progress(mut self, callback: impl Fn(f64, String) + Send + Sync + 'static) -> Self {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn capture_dir(&self) -> &Path {
        &self.capture_dir
    }

    /// Run the whole session. The mount is parked on the way out whenever it
    /// was unparked, unless a forced exit was requested.
    pub async fn run(mut self) -> SequencerResult<SessionSummary> {
        let started = Instant::now();
        tracing::info!(
            target: "session",
            "Session for {} at {} starting, images to {}",
            self.config.target.label(),
            self.target,
            self.capture_dir.display()
        );

        let outcome = match self.run_session().await {
            Err(SequencerError::Cancelled) => Ok(TerminationReason::OperatorStop),
            other => other,
        };

        let park_result = self.shut_down().await;
        self.set_phase(SessionPhase::Terminated);

        let reason = match (outcome, park_result) {
            (Ok(reason), Ok(())) => reason,
            (Ok(_), Err(park_error)) => return Err(park_error),
            (Err(e), park_result) => {
                if let Err(park_error) = park_result {
                    tracing::error!(target: "session", "{}", park_error);
                }
                tracing::error!(target: "session", "Session failed: {}", e);
                return Err(e);
            }
        };

        let summary = SessionSummary {
            reason,
            images_captured: self.state.images_captured,
            flips: self.state.flips,
            focus_runs: self.state.focus_runs,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            target: "session",
            reason = %summary.reason,
            images = summary.images_captured,
            flips = summary.flips,
            focus_runs = summary.focus_runs,
            "Session finished: {}, {} image(s) in {:.1} min",
            summary.reason,
            summary.images_captured,
            summary.elapsed.as_secs_f64() / 60.0
        );
        Ok(summary)
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.state.phase != phase {
            tracing::info!(
                target: "session",
                from = %self.state.phase,
                to = %phase,
                "Phase {} -> {}",
                self.state.phase,
                phase
            );
            self.state.phase = phase;
        }
    }

    fn report_progress(&self, percent: f64, message: String) {
        if let Some(cb) = &self.progress_callback {
            cb(percent, message);
        }
    }

    async fn run_session(&mut self) -> SequencerResult<TerminationReason> {
        self.set_phase(SessionPhase::Initializing);

        tokio::fs::create_dir_all(&self.capture_dir).await.map_err(|e| {
            SequencerError::Config(format!(
                "cannot create capture directory {}: {}",
                self.capture_dir.display(),
                e
            ))
        })?;

        let ports = PreflightPorts {
            disk: self.ports.disk.as_ref(),
            calendar: self.ports.calendar.as_deref(),
            prompt: self.ports.prompt.as_ref(),
        };
        run_preflight(&self.config.preflight, &self.capture_dir, &ports).await?;

        if self.shutdown.is_requested() {
            return Ok(TerminationReason::OperatorStop);
        }

        self.ports
            .mount
            .unpark()
            .await
            .map_err(|e| SequencerError::device("unpark", e))?;
        self.state.unparked = true;

        self.run_alignment().await?;
        self.start_guiding().await?;

        if self.config.focus.skip_initial {
            tracing::info!(target: "session", "Initial autofocus skipped");
        } else {
            self.run_focus().await?;
        }
        self.state.last_focus_time = Some(Instant::now());

        self.imaging_loop().await
    }

    // =========================================================================
    // ALIGNMENT AND GUIDING
    // =========================================================================

    async fn run_alignment(&mut self) -> SequencerResult<()> {
        self.set_phase(SessionPhase::Aligning);
        let alignment = &self.config.alignment;
        self.ports
            .camera
            .change_filter(&alignment.filter)
            .await
            .map_err(|e| SequencerError::device(format!("filter change to {}", alignment.filter), e))?;

        let settings = AlignmentSettings {
            threshold_arcsec: alignment.threshold_arcsec,
            max_iterations: alignment.max_iterations,
            exposure: alignment.exposure_request(),
            image_dir: self.capture_dir.join("scratch"),
        };
        align(
            self.ports.mount.as_ref(),
            self.ports.camera.as_ref(),
            self.ports.solver.as_ref(),
            &self.target,
            &settings,
            &self.shutdown,
        )
        .await?
        .into_result()?;
        Ok(())
    }

    async fn start_guiding(&mut self) -> SequencerResult<()> {
        if !self.config.guiding.enabled {
            return Ok(());
        }
        let Some(guider) = self.ports.guider.clone() else {
            tracing::warn!(target: "guider", "Guiding enabled but no guider available, imaging unguided");
            return Ok(());
        };

        let limit = Duration::from_secs_f64(self.config.guiding.start_timeout.max(1.0));
        let settle = self.config.guiding.settle();
        let mandatory = self.config.guiding.mandatory;
        self.set_phase(SessionPhase::Guiding);

        let result = match tokio::time::timeout(limit, guider.start(&settle)).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::timeout("guider start", limit)),
        };

        match result {
            Ok(()) => {
                self.state.guiding = true;
                tracing::info!(target: "guider", "Guiding started and settled");
                Ok(())
            }
            Err(e) if mandatory => {
                tracing::error!(target: "guider", "Guider start failed: {}", e);
                Err(SequencerError::device("guider start", e))
            }
            Err(e) => {
                tracing::warn!(target: "guider", "Guider start failed, continuing unguided: {}", e);
                Ok(())
            }
        }
    }

    async fn stop_guiding(&mut self) {
        if !self.state.guiding {
            return;
        }
        if let Some(guider) = &self.ports.guider {
            match guider.stop().await {
                Ok(()) => tracing::info!(target: "guider", "Guiding stopped"),
                Err(e) => tracing::warn!(target: "guider", "Guider stop failed: {}", e),
            }
        }
        self.state.guiding = false;
    }

    // =========================================================================
    // FOCUS
    // =========================================================================

    /// One autofocus pass. Failure is logged and imaging continues at the last
    /// good position, unless focus is mandatory.
    async fn run_focus(&mut self) -> SequencerResult<()> {
        if !self.config.focus.enabled {
            return Ok(());
        }
        let Some(focuser) = self.ports.focuser.clone() else {
            return Ok(());
        };

        self.set_phase(SessionPhase::Focusing);
        self.state.focus_runs += 1;

        let focus = self.config.focus.clone();
        let outcome: SequencerResult<_> = async {
            self.ports
                .camera
                .change_filter(&focus.filter)
                .await
                .map_err(|e| SequencerError::device(format!("filter change to {}", focus.filter), e))?;
            let current = focuser
                .position()
                .await
                .map_err(|e| SequencerError::device("read focuser position", e))?;
            if self.state.last_good_focus.is_none() {
                self.state.last_good_focus = Some(current);
            }
            let settings = AutofocusSettings::around(
                current,
                focus.step,
                focus.steps_each_side,
                focus.backlash_margin,
                focus.exposure_request(),
                self.capture_dir.join("scratch"),
            );
            autofocus(
                focuser.as_ref(),
                self.ports.camera.as_ref(),
                self.ports.metrics.as_ref(),
                &settings,
                &self.shutdown,
            )
            .await
        }
        .await;

        self.state.last_focus_time = Some(Instant::now());

        match outcome {
            Ok(result) => {
                self.state.last_good_focus = Some(result.best_position);
                Ok(())
            }
            Err(SequencerError::Cancelled) => {
                if let Some(good) = self.state.last_good_focus {
                    tracing::info!(target: "autofocus", "Focus run stopped, returning focuser to {}", good);
                    if let Err(move_error) = focuser.move_to(good).await {
                        tracing::error!(
                            target: "autofocus",
                            "Could not return focuser to {}: {}",
                            good,
                            move_error
                        );
                    }
                }
                Err(SequencerError::Cancelled)
            }
            Err(e) if focus.mandatory => {
                tracing::error!(target: "autofocus", "Autofocus failed: {}", e);
                Err(e)
            }
            Err(e) => {
                tracing::warn!(target: "autofocus", "Autofocus failed, keeping last good focus: {}", e);
                if let Some(good) = self.state.last_good_focus {
                    if let Err(move_error) = focuser.move_to(good).await {
                        tracing::error!(
                            target: "autofocus",
                            "Could not return focuser to {}: {}",
                            good,
                            move_error
                        );
                    }
                }
                Ok(())
            }
        }
    }

    fn focus_due(&self) -> bool {
        if !self.config.focus.enabled || self.ports.focuser.is_none() {
            return false;
        }
        match self.state.last_focus_time {
            Some(last) => last.elapsed() >= self.config.focus.interval(),
            None => true,
        }
    }

    // =========================================================================
    // MERIDIAN FLIP
    // =========================================================================

    async fn meridian_flip(&mut self, filter: &str) -> SequencerResult<()> {
        self.set_phase(SessionPhase::Flipping);
        self.state.flip_attempts += 1;
        tracing::info!(target: "session", attempt = self.state.flip_attempts, "Meridian flip needed");

        self.stop_guiding().await;

        let current = self
            .ports
            .mount
            .coordinates()
            .await
            .map_err(|e| SequencerError::device("read coordinates before flip", e))?;
        let intermediate = current.offset_ra(FLIP_INTERMEDIATE_RA_HOURS);
        tracing::info!(target: "session", "Flip: intermediate goto to {}", intermediate);
        self.ports
            .mount
            .goto(&intermediate)
            .await
            .map_err(|e| SequencerError::device(format!("flip goto to {}", intermediate), e))?;
        self.ports
            .mount
            .goto(&self.target)
            .await
            .map_err(|e| SequencerError::device(format!("flip goto to {}", self.target), e))?;

        self.run_alignment().await?;
        self.start_guiding().await?;
        self.run_focus().await?;
        self.select_filter(filter).await?;

        self.state.flips += 1;
        self.set_phase(SessionPhase::Imaging);
        Ok(())
    }

    // =========================================================================
    // IMAGING
    // =========================================================================

    async fn select_filter(&self, filter: &str) -> SequencerResult<()> {
        self.ports
            .camera
            .change_filter(filter)
            .await
            .map_err(|e| SequencerError::device(format!("filter change to {}", filter), e))
    }

    async fn imaging_loop(&mut self) -> SequencerResult<TerminationReason> {
        self.set_phase(SessionPhase::Imaging);
        let plan = self.config.capture.plan.clone();
        let cycles = self.config.capture.plan_cycles;

        let mut cycle = 0u32;
        loop {
            cycle += 1;
            if cycles != 0 && cycle > cycles {
                return Ok(TerminationReason::PlanComplete);
            }
            tracing::info!(target: "session", cycle, "Starting plan cycle {}", cycle);

            for entry in &plan {
                self.select_filter(&entry.filter).await?;
                for index in 0..entry.repeat {
                    if let Gate::Stop(reason) = self.before_exposure(entry).await? {
                        return Ok(reason);
                    }
                    self.capture_frame(entry, index).await?;
                }
            }
        }
    }

    /// Checks run before every exposure, in order: termination, altitude,
    /// meridian flip, focus interval, dither. An action returns to the top.
    async fn before_exposure(&mut self, entry: &PlanEntry) -> SequencerResult<Gate> {
        loop {
            if self.shutdown.is_requested() {
                tracing::info!(target: "session", "Termination requested, no further exposures");
                return Ok(Gate::Stop(TerminationReason::OperatorStop));
            }

            match self.ports.mount.altitude().await {
                Ok(altitude) => {
                    self.state.current_altitude = Some(altitude);
                    if altitude <= self.config.limits.min_altitude {
                        tracing::info!(
                            target: "session",
                            altitude,
                            "Altitude {:.1}° at or below limit {:.1}°",
                            altitude,
                            self.config.limits.min_altitude
                        );
                        return Ok(Gate::Stop(TerminationReason::AltitudeLimit));
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "session", "Altitude unavailable, not acting on it: {}", e);
                }
            }

            let read = self.ports.mount.status().await;
            if let Some(status) = self.monitor.observe(read)? {
                if status.flip_due() {
                    if self.state.flip_attempts >= MAX_FLIP_ATTEMPTS {
                        return Err(SequencerError::FlipFailed(format!(
                            "still due after {} attempts ({})",
                            self.state.flip_attempts, status
                        )));
                    }
                    self.meridian_flip(&entry.filter).await?;
                    continue;
                }
                self.state.flip_attempts = 0;
            }

            if self.focus_due() {
                tracing::info!(target: "session", "Focus interval elapsed");
                self.run_focus().await?;
                self.select_filter(&entry.filter).await?;
                self.set_phase(SessionPhase::Imaging);
                continue;
            }

            if self.dither_due() {
                self.dither().await;
                continue;
            }

            return Ok(Gate::Capture);
        }
    }

    fn dither_due(&self) -> bool {
        let period = self.config.guiding.dither_period;
        self.state.guiding && period > 0 && self.state.images_since_dither >= period
    }

    async fn dither(&mut self) {
        self.state.images_since_dither = 0;
        let Some(guider) = &self.ports.guider else {
            return;
        };
        let guiding = &self.config.guiding;
        tracing::info!(target: "guider", pixels = guiding.dither_pixels, "Dithering");
        match guider.dither(guiding.dither_pixels, &guiding.dither_settle()).await {
            Ok(()) => tracing::info!(target: "guider", "Dithering complete"),
            Err(e) => tracing::warn!(target: "guider", "Dithering failed: {}", e),
        }
    }

    async fn capture_frame(&mut self, entry: &PlanEntry, index: u32) -> SequencerResult<()> {
        let path = next_capture_path(&self.capture_dir);
        let request = self.config.capture.exposure_request(entry);
        tracing::info!(
            target: "session",
            filter = %entry.filter,
            exposure = entry.exposure,
            image = %path.display(),
            "Capturing {} {}/{} ({:.0}s) to {}",
            entry.filter,
            index + 1,
            entry.repeat,
            entry.exposure,
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );

        let camera = self.ports.camera.clone();
        let written = self
            .wait_for_exposure(camera.capture(&request, &path), entry.exposure)
            .await
            .map_err(|e| SequencerError::device(format!("capture to {}", path.display()), e))?;

        self.state.images_captured += 1;
        self.state.images_since_dither += 1;
        tracing::info!(
            target: "session",
            images = self.state.images_captured,
            "Saved {}",
            written.display()
        );
        Ok(())
    }

    /// Drive an exposure to completion, reporting progress once a second.
    /// A termination request never cuts the exposure short.
    async fn wait_for_exposure<F, T>(&self, exposure: F, seconds: f64) -> T
    where
        F: Future<Output = T>,
    {
        tokio::pin!(exposure);
        let started = Instant::now();
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop_noted = false;

        loop {
            tokio::select! {
                output = &mut exposure => {
                    self.report_progress(100.0, "Exposure complete".to_string());
                    return output;
                }
                _ = ticker.tick() => {
                    let elapsed = started.elapsed().as_secs_f64();
                    let remaining = (seconds - elapsed).max(0.0);
                    let percent = if seconds > 0.0 {
                        (elapsed / seconds * 100.0).min(99.0)
                    } else {
                        99.0
                    };
                    self.report_progress(percent, format!("Exposing: {:.0}s remaining", remaining));
                    if self.shutdown.is_requested() && !stop_noted {
                        stop_noted = true;
                        tracing::info!(target: "session", "Termination requested, finishing current exposure");
                    }
                }
            }
        }
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    async fn shut_down(&mut self) -> SequencerResult<()> {
        if !self.state.unparked {
            return Ok(());
        }
        if self.shutdown.is_forced() {
            tracing::warn!(target: "session", "Forced exit: mount left unparked");
            return Ok(());
        }

        self.set_phase(SessionPhase::Parking);
        self.stop_guiding().await;
        self.ports
            .mount
            .park()
            .await
            .map_err(|e| SequencerError::device("park", e))?;
        self.state.unparked = false;
        tracing::info!(target: "session", "Mount parked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        tracking_status, AmpleDisk, ContinuePrompt, Journal, MockCamera, MockFocuser, MockGuider,
        MockMount, MockSolver, MockStarMetrics,
    };
    use crate::meridian::PierSide;
    use std::sync::Mutex;

    const SESSION: &str = r#"
[target]
name = "M42"
ra = "5:35:17"
dec = "-5:23:24"

[guiding]
enabled = false

[focus]
enabled = false
"#;

    struct Rig {
        journal: Journal,
        mount: Arc<MockMount>,
        camera: Arc<MockCamera>,
        focuser: Option<Arc<MockFocuser>>,
        guider: Option<Arc<MockGuider>>,
        solver: Option<MockSolver>,
        focus_curve: Option<Box<dyn Fn(i32) -> Option<f64> + Send + Sync>>,
    }

    impl Rig {
        fn new() -> Self {
            Self::with_camera_delay(Duration::ZERO)
        }

        fn with_camera_delay(delay: Duration) -> Self {
            let journal = Journal::default();
            Self {
                mount: MockMount::new(journal.clone()),
                camera: Arc::new(MockCamera::with_delay(journal.clone(), delay)),
                focuser: None,
                guider: None,
                solver: None,
                focus_curve: None,
                journal,
            }
        }

        fn with_focuser(mut self, initial: i32) -> Self {
            self.focuser = Some(Arc::new(MockFocuser::new(self.journal.clone(), initial)));
            self
        }

        fn with_focus_curve(mut self, curve: impl Fn(i32) -> Option<f64> + Send + Sync + 'static) -> Self {
            self.focus_curve = Some(Box::new(curve));
            self
        }

        fn with_guider(mut self) -> Self {
            self.guider = Some(Arc::new(MockGuider::new(self.journal.clone())));
            self
        }

        fn ports(&mut self) -> SessionPorts {
            let solver = self
                .solver
                .take()
                .unwrap_or_else(|| MockSolver::exact(self.mount.clone()));
            let position = self
                .focuser
                .as_ref()
                .map(|f| f.position_handle())
                .unwrap_or_default();
            SessionPorts {
                mount: self.mount.clone(),
                camera: self.camera.clone(),
                solver: Arc::new(solver),
                metrics: Arc::new(match self.focus_curve.take() {
                    Some(curve) => MockStarMetrics::new(position, curve),
                    None => MockStarMetrics::new(position, |p| Some(2.0 + ((p - 5100) as f64 / 25.0).powi(2))),
                }),
                focuser: self.focuser.clone().map(|f| f as SharedFocuser),
                guider: self.guider.clone().map(|g| g as SharedGuider),
                disk: Arc::new(AmpleDisk),
                calendar: None,
                prompt: Arc::new(ContinuePrompt),
            }
        }

        fn focus_frames(&self) -> usize {
            self.camera
                .exposures()
                .iter()
                .filter(|(_, path)| {
                    path.file_name()
                        .map(|n| n.to_string_lossy().starts_with("focus-"))
                        .unwrap_or(false)
                })
                .count()
        }

        fn captures(&self) -> usize {
            self.camera
                .exposures()
                .iter()
                .filter(|(_, path)| {
                    path.file_name()
                        .map(|n| n.to_string_lossy().starts_with("capture-"))
                        .unwrap_or(false)
                })
                .count()
        }
    }

    fn config(dir: &Path, plan: &[(&str, f64, u32)]) -> SessionConfig {
        let mut config = SessionConfig::from_toml_str(SESSION).unwrap();
        config.capture.directory = dir.to_path_buf();
        config.capture.plan = plan
            .iter()
            .map(|(filter, exposure, repeat)| PlanEntry {
                filter: filter.to_string(),
                exposure: *exposure,
                repeat: *repeat,
            })
            .collect();
        config
    }

    fn enable_focus(config: &mut SessionConfig) {
        config.focus.enabled = true;
        config.focus.step = 25;
        config.focus.steps_each_side = 2;
    }

    #[test]
    fn test_capture_directory_uses_target_label() {
        let config = config(Path::new("/data"), &[("L", 1.0, 1)]);
        assert_eq!(capture_directory(&config), PathBuf::from("/data/M42"));
    }

    #[tokio::test]
    async fn test_plan_completes_and_parks() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new().with_focuser(5100).with_guider();
        let mut config = config(dir.path(), &[("L", 1.0, 2), ("R", 1.0, 1)]);
        config.guiding.enabled = true;
        enable_focus(&mut config);

        let summary = SessionExecutor::new(config, rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.reason, TerminationReason::PlanComplete);
        assert_eq!(summary.images_captured, 3);
        assert_eq!(summary.focus_runs, 1);
        assert_eq!(rig.captures(), 3);
        assert!(rig.mount.is_parked());

        let entries = rig.journal.entries();
        assert_eq!(entries.first().map(String::as_str), Some("unpark"));
        assert_eq!(entries.last().map(String::as_str), Some("park"));
        assert!(rig.journal.position("sync") < rig.journal.position("guide:start"));
        assert_eq!(rig.camera.filters(), vec!["L", "L", "L", "R"]);
        assert_eq!(rig.focuser.as_ref().unwrap().moves().last(), Some(&5100));
    }

    #[tokio::test]
    async fn test_plan_cycles_repeat_the_plan() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        let mut config = config(dir.path(), &[("L", 1.0, 1), ("R", 1.0, 1)]);
        config.capture.plan_cycles = 3;

        let summary = SessionExecutor::new(config, rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.images_captured, 6);
        assert_eq!(rig.captures(), 6);
    }

    #[tokio::test]
    async fn test_altitude_limit_stops_imaging() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        rig.mount
            .set_altitude(|poll| Ok(if poll < 2 { 45.0 } else { -1.0 }));
        let config = config(dir.path(), &[("L", 1.0, 10)]);

        let summary = SessionExecutor::new(config, rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.reason, TerminationReason::AltitudeLimit);
        assert_eq!(summary.images_captured, 2);
        assert!(rig.mount.is_parked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_termination_during_exposure_finishes_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::with_camera_delay(Duration::from_secs(30));
        let config = config(dir.path(), &[("L", 30.0, 5)]);
        let shutdown = ShutdownToken::new();
        let progress = Arc::new(Mutex::new(Vec::new()));
        let recorded = progress.clone();
        let requester = shutdown.clone();

        // stop requested ten seconds into the first light frame
        let summary = SessionExecutor::new(config, rig.ports(), shutdown)
            .unwrap()
            .with_progress(move |percent, message| {
                let mut recorded = recorded.lock().unwrap();
                recorded.push((percent, message));
                if recorded.len() == 10 {
                    requester.request();
                }
            })
            .run()
            .await
            .unwrap();

        assert_eq!(summary.reason, TerminationReason::OperatorStop);
        assert_eq!(summary.images_captured, 1);
        assert_eq!(rig.captures(), 1);
        assert!(rig.mount.is_parked());

        let progress = progress.lock().unwrap();
        assert!(progress.len() >= 30, "{} progress reports", progress.len());
        assert_eq!(progress.last().map(|(p, _)| *p), Some(100.0));
    }

    #[tokio::test]
    async fn test_termination_before_start_never_unparks() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        let shutdown = ShutdownToken::new();
        shutdown.request();

        let summary = SessionExecutor::new(config(dir.path(), &[("L", 1.0, 1)]), rig.ports(), shutdown)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.reason, TerminationReason::OperatorStop);
        assert!(rig.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_termination_during_focus_sweep_stops_focusing() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = ShutdownToken::new();
        let requester = shutdown.clone();
        // stop arrives while the first focus frame is measured
        let mut rig = Rig::new().with_focuser(5100).with_focus_curve(move |p| {
            requester.request();
            Some(2.0 + ((p - 5100) as f64 / 25.0).powi(2))
        });
        let mut config = config(dir.path(), &[("L", 1.0, 3)]);
        enable_focus(&mut config);

        let summary = SessionExecutor::new(config, rig.ports(), shutdown)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.reason, TerminationReason::OperatorStop);
        assert_eq!(summary.images_captured, 0);
        assert_eq!(rig.focus_frames(), 1);
        assert_eq!(rig.captures(), 0);
        // no sweep moves, straight back to where focus started
        assert_eq!(rig.focuser.as_ref().unwrap().moves(), vec![5100]);
        assert!(rig.mount.is_parked());
    }

    #[tokio::test]
    async fn test_forced_exit_skips_park() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        let shutdown = ShutdownToken::new();
        let second = shutdown.clone();
        rig.mount.set_altitude(move |_| {
            // both signals arrive while the first exposure is being checked
            second.request();
            second.request();
            Ok(45.0)
        });

        let summary = SessionExecutor::new(config(dir.path(), &[("L", 1.0, 3)]), rig.ports(), shutdown)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.reason, TerminationReason::OperatorStop);
        assert!(!rig.mount.is_parked());
        assert_eq!(rig.journal.count("park"), 0);
    }

    #[tokio::test]
    async fn test_meridian_flip_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new().with_guider();
        rig.mount.set_status(|view| {
            // past the meridian on the west side until the flip gotos have run
            if view.gotos < 2 {
                Ok(tracking_status(view.position, PierSide::West, 0.5))
            } else {
                Ok(tracking_status(view.position, PierSide::East, -0.5))
            }
        });
        let mut config = config(dir.path(), &[("R", 1.0, 2)]);
        config.guiding.enabled = true;
        let target = config.target_coordinate().unwrap();

        let summary = SessionExecutor::new(config, rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.flips, 1);
        assert_eq!(summary.images_captured, 2);

        let gotos = rig.mount.gotos();
        assert_eq!(gotos.len(), 4);
        assert_eq!(gotos[1], target.offset_ra(3.0));
        assert_eq!(gotos[2], target);
        assert_eq!(gotos[3], target);

        let guide_and_goto: Vec<String> = rig
            .journal
            .entries()
            .into_iter()
            .filter(|e| e == "goto" || e.starts_with("guide:"))
            .collect();
        assert_eq!(
            guide_and_goto,
            vec![
                "goto",
                "guide:start",
                "guide:stop",
                "goto",
                "goto",
                "goto",
                "guide:start",
                "guide:stop",
            ]
        );
        // plan filter restored after realignment on L
        assert_eq!(rig.camera.filters(), vec!["L", "R", "L", "R"]);
    }

    #[tokio::test]
    async fn test_flip_that_never_clears_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        rig.mount
            .set_status(|view| Ok(tracking_status(view.position, PierSide::West, 0.5)));

        let result = SessionExecutor::new(config(dir.path(), &[("L", 1.0, 2)]), rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await;

        assert!(matches!(result, Err(SequencerError::FlipFailed(_))));
        // alignment goto plus two flips of three gotos each
        assert_eq!(rig.mount.goto_count(), 7);
        assert_eq!(rig.captures(), 0);
        assert!(rig.mount.is_parked());
    }

    #[tokio::test]
    async fn test_unknown_mount_status_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        rig.mount
            .set_status(|_| Err(DeviceError::timeout("read RASTATUS", Duration::from_secs(2))));
        let mut config = config(dir.path(), &[("L", 1.0, 10)]);
        config.limits.max_unknown_polls = 3;

        let result = SessionExecutor::new(config, rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await;

        assert!(matches!(result, Err(SequencerError::MountUnresponsive { polls: 3 })));
        assert_eq!(rig.captures(), 2);
        assert!(rig.mount.is_parked());
    }

    #[tokio::test]
    async fn test_guider_failure_is_not_fatal_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        rig.guider = Some(Arc::new(MockGuider::failing(rig.journal.clone())));
        let mut config = config(dir.path(), &[("L", 1.0, 3)]);
        config.guiding.enabled = true;
        config.guiding.dither_period = 1;

        let summary = SessionExecutor::new(config, rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.images_captured, 3);
        // no dithering while unguided
        assert_eq!(rig.journal.count("dither"), 0);
    }

    #[tokio::test]
    async fn test_mandatory_guider_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        rig.guider = Some(Arc::new(MockGuider::failing(rig.journal.clone())));
        let mut config = config(dir.path(), &[("L", 1.0, 3)]);
        config.guiding.enabled = true;
        config.guiding.mandatory = true;

        let result = SessionExecutor::new(config, rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await;

        assert!(matches!(result, Err(SequencerError::Device { .. })));
        assert_eq!(rig.captures(), 0);
        assert!(rig.mount.is_parked());
    }

    #[tokio::test]
    async fn test_alignment_failure_is_fatal_and_parks() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        rig.solver = Some(MockSolver::scripted(vec![Err(DeviceError::SolveFailed(
            "no solution".to_string(),
        ))]));

        let result = SessionExecutor::new(config(dir.path(), &[("L", 1.0, 3)]), rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await;

        assert!(matches!(result, Err(SequencerError::SolveFailed { iteration: 1, .. })));
        assert_eq!(rig.captures(), 0);
        assert_eq!(rig.journal.entries().last().map(String::as_str), Some("park"));
    }

    #[tokio::test]
    async fn test_dither_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new().with_guider();
        let mut config = config(dir.path(), &[("L", 1.0, 5)]);
        config.guiding.enabled = true;
        config.guiding.dither_period = 2;

        let summary = SessionExecutor::new(config, rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.images_captured, 5);
        // before the third and the fifth frame
        assert_eq!(rig.journal.count("dither"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_rerun_after_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::with_camera_delay(Duration::from_secs(40)).with_focuser(5100);
        let mut config = config(dir.path(), &[("R", 40.0, 3)]);
        enable_focus(&mut config);
        config.focus.interval_minutes = 1.0;

        let summary = SessionExecutor::new(config, rig.ports(), ShutdownToken::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.images_captured, 3);
        assert_eq!(summary.focus_runs, 2);
        // plan filter restored after the second focus run
        assert_eq!(rig.camera.filters(), vec!["L", "L", "R", "L", "R"]);
    }

    #[tokio::test]
    async fn test_focus_failure_returns_to_last_good_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new().with_focuser(5100);
        let mut config = config(dir.path(), &[("L", 1.0, 1)]);
        enable_focus(&mut config);
        let mut ports = rig.ports();
        ports.metrics = Arc::new(MockStarMetrics::new(
            rig.focuser.as_ref().unwrap().position_handle(),
            |_| None,
        ));

        let summary = SessionExecutor::new(config, ports, ShutdownToken::new())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.images_captured, 1);
        assert_eq!(rig.focuser.as_ref().unwrap().moves().last(), Some(&5100));
    }
}
