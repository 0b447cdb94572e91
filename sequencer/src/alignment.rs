//! Closed-loop pointing alignment
//!
//! Each iteration runs goto -> capture -> solve -> sync strictly in that order.
//! The mount is treated as a black box: after every sync its own model has been
//! corrected, so the next goto aims at the target itself and convergence comes
//! purely from repeated measurement.

use crate::coordinates::{format_dms, format_hms, normalize_ra_delta_hours, EquatorialCoordinate};
use crate::device_ops::{CameraPort, ExposureRequest, MountPort, PlateSolver};
use crate::error::{SequencerError, SequencerResult};
use crate::frames::scratch_frame_path;
use crate::shutdown::ShutdownToken;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct AlignmentSettings {
    pub threshold_arcsec: f64,
    pub max_iterations: u32,
    pub exposure: ExposureRequest,
    /// Where alignment frames are written
    pub image_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AlignmentIteration {
    pub iteration: u32,
    pub solved: EquatorialCoordinate,
    pub error_arcsec: f64,
    pub duration: Duration,
    pub image: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AlignmentReport {
    pub converged: bool,
    pub iterations: Vec<AlignmentIteration>,
}

impl AlignmentReport {
    pub fn last_error_arcsec(&self) -> Option<f64> {
        self.iterations.last().map(|i| i.error_arcsec)
    }

    /// Turn a non-converged report into the session-level error
    pub fn into_result(self) -> SequencerResult<AlignmentReport> {
        if self.converged {
            Ok(self)
        } else {
            Err(SequencerError::AlignmentNotConverged {
                iterations: self.iterations.len() as u32,
                last_error_arcsec: self.last_error_arcsec().unwrap_or(f64::NAN),
            })
        }
    }
}

/// Flat pointing error in arcseconds. RA error is not scaled by cos(dec).
pub fn pointing_error_arcsec(target: &EquatorialCoordinate, solved: &EquatorialCoordinate) -> f64 {
    let ra_arcsec = normalize_ra_delta_hours(solved.ra_hours - target.ra_hours) * 15.0 * 3600.0;
    let dec_arcsec = (solved.dec_degrees - target.dec_degrees) * 3600.0;
    ra_arcsec.hypot(dec_arcsec)
}

/// Converge the mount onto `target`.
///
/// Returns a report with `converged == false` when `max_iterations` is used up.
/// A solver failure ends the alignment immediately with `SolveFailed`.
pub async fn align(
    mount: &dyn MountPort,
    camera: &dyn CameraPort,
    solver: &dyn PlateSolver,
    target: &EquatorialCoordinate,
    settings: &AlignmentSettings,
    shutdown: &ShutdownToken,
) -> SequencerResult<AlignmentReport> {
    tracing::info!(
        target: "alignment",
        "Aligning to {} (threshold {:.1}\", max {} iterations)",
        target,
        settings.threshold_arcsec,
        settings.max_iterations
    );

    let mut iterations = Vec::new();

    for iteration in 1..=settings.max_iterations {
        if shutdown.is_requested() {
            tracing::info!(target: "alignment", "Alignment interrupted by termination request");
            return Err(SequencerError::Cancelled);
        }

        let started = Instant::now();

        mount
            .goto(target)
            .await
            .map_err(|e| SequencerError::device(format!("alignment goto to {}", target), e))?;

        let output = scratch_frame_path(&settings.image_dir, "align");
        let image = camera
            .capture(&settings.exposure, &output)
            .await
            .map_err(|e| SequencerError::device("alignment capture", e))?;

        let solved = solver.solve(&image).await.map_err(|e| {
            tracing::error!(
                target: "alignment",
                iteration,
                image = %image.display(),
                "Plate solve failed: {}",
                e
            );
            SequencerError::SolveFailed {
                iteration,
                reason: e.to_string(),
            }
        })?;

        mount
            .sync(&solved)
            .await
            .map_err(|e| SequencerError::device(format!("alignment sync to {}", solved), e))?;

        let error_arcsec = pointing_error_arcsec(target, &solved);
        let duration = started.elapsed();

        tracing::info!(
            target: "alignment",
            iteration,
            ra = %format_hms(solved.ra_hours),
            dec = %format_dms(solved.dec_degrees),
            error_arcsec,
            duration_secs = duration.as_secs_f64(),
            image = %image.display(),
            "Iteration {}: solved {} error {:.1}\" in {:.1}s",
            iteration,
            solved,
            error_arcsec,
            duration.as_secs_f64()
        );

        iterations.push(AlignmentIteration {
            iteration,
            solved,
            error_arcsec,
            duration,
            image,
        });

        if error_arcsec < settings.threshold_arcsec {
            tracing::info!(
                target: "alignment",
                "Aligned within {:.1}\" after {} iteration(s)",
                error_arcsec,
                iteration
            );
            return Ok(AlignmentReport {
                converged: true,
                iterations,
            });
        }
    }

    tracing::warn!(
        target: "alignment",
        "Max iterations reached ({}) without converging below {:.1}\"",
        settings.max_iterations,
        settings.threshold_arcsec
    );
    Ok(AlignmentReport {
        converged: false,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::testing::{Journal, MockCamera, MockMount, MockSolver};
    use approx::assert_abs_diff_eq;

    fn settings(dir: &std::path::Path, threshold: f64, max_iterations: u32) -> AlignmentSettings {
        AlignmentSettings {
            threshold_arcsec: threshold,
            max_iterations,
            exposure: ExposureRequest {
                seconds: 2.0,
                gain: 70,
                offset: 20,
            },
            image_dir: dir.to_path_buf(),
        }
    }

    fn offset_arcsec(target: &EquatorialCoordinate, dec_arcsec: f64) -> EquatorialCoordinate {
        EquatorialCoordinate::new(target.ra_hours, target.dec_degrees + dec_arcsec / 3600.0).unwrap()
    }

    #[test]
    fn test_pointing_error_flat_approximation() {
        let target = EquatorialCoordinate::new(5.5, 80.0).unwrap();
        // One second of RA is 15" regardless of declination
        let solved = EquatorialCoordinate::new(5.5 + 1.0 / 3600.0, 80.0).unwrap();
        assert_abs_diff_eq!(pointing_error_arcsec(&target, &solved), 15.0, epsilon = 1e-6);

        let solved = EquatorialCoordinate::new(5.5, 80.0 + 20.0 / 3600.0).unwrap();
        assert_abs_diff_eq!(pointing_error_arcsec(&target, &solved), 20.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pointing_error_across_ra_wrap() {
        let target = EquatorialCoordinate::new(23.9999, 0.0).unwrap();
        let solved = EquatorialCoordinate::new(0.0001, 0.0).unwrap();
        assert_abs_diff_eq!(pointing_error_arcsec(&target, &solved), 0.0002 * 54000.0, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_exact_solve_converges_in_one_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::default();
        let mount = MockMount::new(journal.clone());
        let camera = MockCamera::new(journal.clone());
        let solver = MockSolver::exact(mount.clone());
        let target = EquatorialCoordinate::new(5.5, -5.0).unwrap();

        let report = align(
            mount.as_ref(),
            &camera,
            &solver,
            &target,
            &settings(dir.path(), 30.0, 10),
            &ShutdownToken::new(),
        )
        .await
        .unwrap();

        assert!(report.converged);
        assert_eq!(report.iterations.len(), 1);
        assert_eq!(report.iterations[0].error_arcsec, 0.0);
        assert_eq!(journal.entries(), vec!["goto", "capture", "solve", "sync"]);
    }

    #[tokio::test]
    async fn test_converges_as_error_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::default();
        let mount = MockMount::new(journal.clone());
        let camera = MockCamera::new(journal.clone());
        let target = EquatorialCoordinate::new(5.5, -5.0).unwrap();
        let solver = MockSolver::scripted(vec![
            Ok(offset_arcsec(&target, 600.0)),
            Ok(offset_arcsec(&target, 90.0)),
            Ok(offset_arcsec(&target, 8.0)),
        ]);

        let report = align(
            mount.as_ref(),
            &camera,
            &solver,
            &target,
            &settings(dir.path(), 20.0, 10),
            &ShutdownToken::new(),
        )
        .await
        .unwrap();

        assert!(report.converged);
        assert_eq!(report.iterations.len(), 3);
        assert_abs_diff_eq!(report.last_error_arcsec().unwrap(), 8.0, epsilon = 1e-6);
        assert_eq!(mount.goto_count(), 3);
        assert_eq!(mount.sync_count(), 3);
    }

    #[tokio::test]
    async fn test_stops_at_max_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::default();
        let mount = MockMount::new(journal.clone());
        let camera = MockCamera::new(journal.clone());
        let target = EquatorialCoordinate::new(12.0, 45.0).unwrap();
        let solver = MockSolver::scripted((0..10).map(|_| Ok(offset_arcsec(&target, 60.0))).collect());

        let report = align(
            mount.as_ref(),
            &camera,
            &solver,
            &target,
            &settings(dir.path(), 20.0, 4),
            &ShutdownToken::new(),
        )
        .await
        .unwrap();

        assert!(!report.converged);
        assert_eq!(report.iterations.len(), 4);
        assert_eq!(mount.goto_count(), 4);
        assert!(matches!(
            report.into_result(),
            Err(SequencerError::AlignmentNotConverged { iterations: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_solve_failure_aborts_without_sync() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::default();
        let mount = MockMount::new(journal.clone());
        let camera = MockCamera::new(journal.clone());
        let target = EquatorialCoordinate::new(5.5, -5.0).unwrap();
        let solver = MockSolver::scripted(vec![
            Ok(offset_arcsec(&target, 300.0)),
            Err(DeviceError::SolveFailed("no solution".to_string())),
        ]);

        let result = align(
            mount.as_ref(),
            &camera,
            &solver,
            &target,
            &settings(dir.path(), 20.0, 10),
            &ShutdownToken::new(),
        )
        .await;

        assert!(matches!(result, Err(SequencerError::SolveFailed { iteration: 2, .. })));
        assert_eq!(mount.goto_count(), 2);
        assert_eq!(mount.sync_count(), 1);
    }

    #[tokio::test]
    async fn test_termination_checked_before_each_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::default();
        let mount = MockMount::new(journal.clone());
        let camera = MockCamera::new(journal.clone());
        let solver = MockSolver::exact(mount.clone());
        let shutdown = ShutdownToken::new();
        shutdown.request();

        let result = align(
            mount.as_ref(),
            &camera,
            &solver,
            &EquatorialCoordinate::new(5.5, -5.0).unwrap(),
            &settings(dir.path(), 20.0, 10),
            &shutdown,
        )
        .await;

        assert!(matches!(result, Err(SequencerError::Cancelled)));
        assert!(journal.entries().is_empty());
    }
}
