//! In-memory port implementations for unit tests

use crate::coordinates::EquatorialCoordinate;
use crate::device_ops::{
    Autoguider, CameraPort, ExposureRequest, FocuserPort, MountPort, PlateSolver, SettleSpec,
    StarMeasurement, StarMetrics,
};
use crate::error::{DeviceError, DeviceResult};
use crate::meridian::{PierSide, RawMountStatus};
use crate::preflight::{DiskSpaceProbe, OperatorPrompt};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered record of device commands across all mocks
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }
}

// =============================================================================
// MOUNT
// =============================================================================

/// What a scripted status function can see
#[derive(Debug, Clone, Copy)]
pub struct MountView {
    pub polls: usize,
    pub gotos: usize,
    pub position: EquatorialCoordinate,
}

type StatusFn = Box<dyn FnMut(MountView) -> DeviceResult<RawMountStatus> + Send>;
type AltitudeFn = Box<dyn FnMut(usize) -> DeviceResult<f64> + Send>;

pub struct MockMount {
    journal: Journal,
    position: Mutex<EquatorialCoordinate>,
    gotos: Mutex<Vec<EquatorialCoordinate>>,
    syncs: Mutex<Vec<EquatorialCoordinate>>,
    polls: AtomicUsize,
    altitude_polls: AtomicUsize,
    status_fn: Mutex<StatusFn>,
    altitude_fn: Mutex<AltitudeFn>,
    parked: AtomicBool,
}

/// A tracking mount at hour angle `ha` on the given pier side
pub fn tracking_status(position: EquatorialCoordinate, pier_side: PierSide, ha: f64) -> RawMountStatus {
    RawMountStatus {
        ra_axis: vec![
            ("RARunning".to_string(), "Ok".to_string()),
            ("RAGoto".to_string(), "Busy".to_string()),
            ("RAHighspeed".to_string(), "Busy".to_string()),
        ],
        dec_axis: vec![("DERunning".to_string(), "Idle".to_string())],
        coordinates: position,
        lst_hours: (position.ra_hours + ha).rem_euclid(24.0),
        pier_side,
        tracking_switch: Some(true),
        coordinates_busy: false,
    }
}

impl MockMount {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            position: Mutex::new(EquatorialCoordinate::new(0.0, 90.0).unwrap()),
            gotos: Mutex::new(Vec::new()),
            syncs: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            altitude_polls: AtomicUsize::new(0),
            status_fn: Mutex::new(Box::new(|view: MountView| -> DeviceResult<RawMountStatus> {
                Ok(tracking_status(view.position, PierSide::West, 0.0))
            })),
            altitude_fn: Mutex::new(Box::new(|_: usize| -> DeviceResult<f64> { Ok(45.0) })),
            parked: AtomicBool::new(true),
        })
    }

    pub fn set_status(&self, f: impl FnMut(MountView) -> DeviceResult<RawMountStatus> + Send + 'static) {
        *self.status_fn.lock().unwrap() = Box::new(f);
    }

    pub fn set_altitude(&self, f: impl FnMut(usize) -> DeviceResult<f64> + Send + 'static) {
        *self.altitude_fn.lock().unwrap() = Box::new(f);
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn current(&self) -> EquatorialCoordinate {
        *self.position.lock().unwrap()
    }

    pub fn goto_count(&self) -> usize {
        self.gotos.lock().unwrap().len()
    }

    pub fn gotos(&self) -> Vec<EquatorialCoordinate> {
        self.gotos.lock().unwrap().clone()
    }

    pub fn sync_count(&self) -> usize {
        self.syncs.lock().unwrap().len()
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MountPort for MockMount {
    async fn coordinates(&self) -> DeviceResult<EquatorialCoordinate> {
        Ok(self.current())
    }

    async fn goto(&self, target: &EquatorialCoordinate) -> DeviceResult<()> {
        self.journal.push("goto");
        self.gotos.lock().unwrap().push(*target);
        *self.position.lock().unwrap() = *target;
        Ok(())
    }

    async fn sync(&self, position: &EquatorialCoordinate) -> DeviceResult<()> {
        self.journal.push("sync");
        self.syncs.lock().unwrap().push(*position);
        Ok(())
    }

    async fn status(&self) -> DeviceResult<RawMountStatus> {
        let view = MountView {
            polls: self.polls.fetch_add(1, Ordering::SeqCst),
            gotos: self.goto_count(),
            position: self.current(),
        };
        let mut status_fn = self.status_fn.lock().unwrap();
        (*status_fn)(view)
    }

    async fn altitude(&self) -> DeviceResult<f64> {
        let poll = self.altitude_polls.fetch_add(1, Ordering::SeqCst);
        let mut altitude_fn = self.altitude_fn.lock().unwrap();
        (*altitude_fn)(poll)
    }

    async fn park(&self) -> DeviceResult<()> {
        self.journal.push("park");
        self.parked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unpark(&self) -> DeviceResult<()> {
        self.journal.push("unpark");
        self.parked.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// CAMERA
// =============================================================================

pub struct MockCamera {
    journal: Journal,
    exposures: Mutex<Vec<(f64, PathBuf)>>,
    filters: Mutex<Vec<String>>,
    /// Simulated exposure duration
    delay: Duration,
}

impl MockCamera {
    pub fn new(journal: Journal) -> Self {
        Self::with_delay(journal, Duration::ZERO)
    }

    pub fn with_delay(journal: Journal, delay: Duration) -> Self {
        Self {
            journal,
            exposures: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
            delay,
        }
    }

    pub fn exposures(&self) -> Vec<(f64, PathBuf)> {
        self.exposures.lock().unwrap().clone()
    }

    pub fn filters(&self) -> Vec<String> {
        self.filters.lock().unwrap().clone()
    }
}

#[async_trait]
impl CameraPort for MockCamera {
    async fn change_filter(&self, filter: &str) -> DeviceResult<()> {
        self.journal.push(format!("filter:{}", filter));
        self.filters.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    async fn capture(&self, request: &ExposureRequest, output: &Path) -> DeviceResult<PathBuf> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DeviceError::tool("mock camera", e.to_string()))?;
        }
        std::fs::write(output, b"").map_err(|e| DeviceError::tool("mock camera", e.to_string()))?;
        self.journal.push("capture");
        self.exposures
            .lock()
            .unwrap()
            .push((request.seconds, output.to_path_buf()));
        Ok(output.to_path_buf())
    }
}

// =============================================================================
// SOLVER
// =============================================================================

pub struct MockSolver {
    journal: Option<Journal>,
    script: Mutex<VecDeque<DeviceResult<EquatorialCoordinate>>>,
    mount: Option<Arc<MockMount>>,
}

impl MockSolver {
    /// Always reports exactly where the mount was last sent
    pub fn exact(mount: Arc<MockMount>) -> Self {
        Self {
            journal: Some(mount.journal().clone()),
            script: Mutex::new(VecDeque::new()),
            mount: Some(mount),
        }
    }

    pub fn scripted(results: Vec<DeviceResult<EquatorialCoordinate>>) -> Self {
        Self {
            journal: None,
            script: Mutex::new(results.into()),
            mount: None,
        }
    }
}

#[async_trait]
impl PlateSolver for MockSolver {
    async fn solve(&self, _image: &Path) -> DeviceResult<EquatorialCoordinate> {
        if let Some(journal) = &self.journal {
            journal.push("solve");
        }
        if let Some(result) = self.script.lock().unwrap().pop_front() {
            return result;
        }
        match &self.mount {
            Some(mount) => Ok(mount.current()),
            None => Err(DeviceError::SolveFailed("script exhausted".to_string())),
        }
    }
}

// =============================================================================
// FOCUSER AND STAR METRICS
// =============================================================================

pub struct MockFocuser {
    journal: Journal,
    position: Arc<AtomicI32>,
    moves: Mutex<Vec<i32>>,
}

impl MockFocuser {
    pub fn new(journal: Journal, initial: i32) -> Self {
        Self {
            journal,
            position: Arc::new(AtomicI32::new(initial)),
            moves: Mutex::new(Vec::new()),
        }
    }

    pub fn position_handle(&self) -> Arc<AtomicI32> {
        self.position.clone()
    }

    pub fn moves(&self) -> Vec<i32> {
        self.moves.lock().unwrap().clone()
    }
}

#[async_trait]
impl FocuserPort for MockFocuser {
    async fn position(&self) -> DeviceResult<i32> {
        Ok(self.position.load(Ordering::SeqCst))
    }

    async fn move_to(&self, position: i32) -> DeviceResult<()> {
        self.journal.push(format!("focus:{}", position));
        self.moves.lock().unwrap().push(position);
        self.position.store(position, Ordering::SeqCst);
        Ok(())
    }
}

type CurveFn = Box<dyn Fn(i32) -> Option<f64> + Send + Sync>;

/// FWHM as a function of the focuser position at the time of measurement
pub struct MockStarMetrics {
    position: Arc<AtomicI32>,
    curve: CurveFn,
}

impl MockStarMetrics {
    pub fn new(position: Arc<AtomicI32>, curve: impl Fn(i32) -> Option<f64> + Send + Sync + 'static) -> Self {
        Self {
            position,
            curve: Box::new(curve),
        }
    }
}

#[async_trait]
impl StarMetrics for MockStarMetrics {
    async fn measure(&self, _image: &Path) -> DeviceResult<StarMeasurement> {
        match (self.curve)(self.position.load(Ordering::SeqCst)) {
            Some(fwhm) => Ok(StarMeasurement {
                star_count: 40,
                fwhm,
            }),
            None => Err(DeviceError::NoStarsFound),
        }
    }
}

// =============================================================================
// GUIDER
// =============================================================================

pub struct MockGuider {
    journal: Journal,
    fail_start: AtomicBool,
}

impl MockGuider {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            fail_start: AtomicBool::new(false),
        }
    }

    pub fn failing(journal: Journal) -> Self {
        let guider = Self::new(journal);
        guider.fail_start.store(true, Ordering::SeqCst);
        guider
    }
}

#[async_trait]
impl Autoguider for MockGuider {
    async fn start(&self, _settle: &SettleSpec) -> DeviceResult<()> {
        self.journal.push("guide:start");
        if self.fail_start.load(Ordering::SeqCst) {
            Err(DeviceError::timeout("guider settle", Duration::from_secs(60)))
        } else {
            Ok(())
        }
    }

    async fn stop(&self) -> DeviceResult<()> {
        self.journal.push("guide:stop");
        Ok(())
    }

    async fn dither(&self, _pixels: f64, _settle: &SettleSpec) -> DeviceResult<()> {
        self.journal.push("dither");
        Ok(())
    }
}

// =============================================================================
// PREFLIGHT
// =============================================================================

pub struct AmpleDisk;

#[async_trait]
impl DiskSpaceProbe for AmpleDisk {
    async fn free_bytes(&self, _path: &Path) -> DeviceResult<u64> {
        Ok(u64::MAX)
    }
}

/// Operator who always chooses to continue
pub struct ContinuePrompt;

#[async_trait]
impl OperatorPrompt for ContinuePrompt {
    async fn confirm_abort(&self, _reason: &str) -> bool {
        false
    }
}
