//! Parabolic autofocus
//!
//! The focuser is always approached from below: every sweep and the final move
//! pass through `focus_min - backlash_margin` first, so gear lash is taken up
//! in the same direction for every measurement.

use crate::device_ops::{CameraPort, ExposureRequest, FocuserPort, StarMetrics};
use crate::error::{SequencerError, SequencerResult};
use crate::frames::scratch_frame_path;
use crate::shutdown::ShutdownToken;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AutofocusSettings {
    pub focus_min: i32,
    pub focus_max: i32,
    pub step: i32,
    pub backlash_margin: i32,
    pub exposure: ExposureRequest,
    pub image_dir: PathBuf,
}

impl AutofocusSettings {
    /// Sweep window of `steps_each_side` steps either side of `center`
    pub fn around(
        center: i32,
        step: i32,
        steps_each_side: i32,
        backlash_margin: i32,
        exposure: ExposureRequest,
        image_dir: PathBuf,
    ) -> Self {
        let half_width = step.saturating_mul(steps_each_side);
        Self {
            focus_min: center.saturating_sub(half_width),
            focus_max: center.saturating_add(half_width),
            step,
            backlash_margin,
            exposure,
            image_dir,
        }
    }

    /// Where the focuser is parked before sweeping or final approach
    pub fn approach_position(&self) -> i32 {
        self.focus_min.saturating_sub(self.backlash_margin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusSample {
    pub position: i32,
    /// `None` when the frame could not be measured
    pub star_count: Option<u32>,
    pub fwhm: Option<f64>,
}

/// Quadratic fwhm = a*x^2 + b*x + c over focuser position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusFit {
    pub coefficients: [f64; 3],
    pub vertex_position: i32,
    pub predicted_fwhm: f64,
    pub concave_up: bool,
}

impl FocusFit {
    pub fn evaluate(&self, position: f64) -> f64 {
        let [a, b, c] = self.coefficients;
        a * position * position + b * position + c
    }
}

#[derive(Debug, Clone)]
pub struct AutofocusResult {
    pub best_position: i32,
    pub best_fwhm: f64,
    pub fit: Option<FocusFit>,
    pub samples: Vec<FocusSample>,
    /// Best sampled position was used instead of the fitted vertex
    pub used_fallback: bool,
}

/// Positions from `focus_min` up to `focus_max` inclusive, `step` apart
pub fn sweep_positions(focus_min: i32, focus_max: i32, step: i32) -> Vec<i32> {
    if step <= 0 || focus_max < focus_min {
        return Vec::new();
    }
    let mut positions = Vec::new();
    let mut position = focus_min;
    while position <= focus_max {
        positions.push(position);
        match position.checked_add(step) {
            Some(next) => position = next,
            None => break,
        }
    }
    positions
}

/// Least-squares quadratic through every sample with a FWHM.
///
/// Positions are centred on their mean and scaled before the normal equations
/// are formed; raw focuser steps to the fourth power lose too much precision.
/// Returns `None` with fewer than three usable samples or a singular system.
pub fn fit_parabola(samples: &[FocusSample]) -> Option<FocusFit> {
    let points: Vec<(f64, f64)> = samples
        .iter()
        .filter_map(|s| s.fwhm.map(|fwhm| (s.position as f64, fwhm)))
        .collect();
    if points.len() < 3 {
        return None;
    }

    let n = points.len() as f64;
    let mean = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let scale = points
        .iter()
        .map(|(x, _)| (x - mean).abs())
        .fold(0.0_f64, f64::max);
    if scale == 0.0 {
        return None;
    }

    let mut sum_u = 0.0;
    let mut sum_y = 0.0;
    let mut sum_u2 = 0.0;
    let mut sum_u3 = 0.0;
    let mut sum_u4 = 0.0;
    let mut sum_uy = 0.0;
    let mut sum_u2y = 0.0;

    for &(x, y) in &points {
        let u = (x - mean) / scale;
        sum_u += u;
        sum_y += y;
        sum_u2 += u * u;
        sum_u3 += u * u * u;
        sum_u4 += u * u * u * u;
        sum_uy += u * y;
        sum_u2y += u * u * y;
    }

    // Cramer's rule on the 3x3 normal equations
    let det = n * (sum_u2 * sum_u4 - sum_u3 * sum_u3) - sum_u * (sum_u * sum_u4 - sum_u2 * sum_u3)
        + sum_u2 * (sum_u * sum_u3 - sum_u2 * sum_u2);
    if det.abs() < 1e-12 {
        return None;
    }

    let det_c = sum_y * (sum_u2 * sum_u4 - sum_u3 * sum_u3) - sum_u * (sum_uy * sum_u4 - sum_u2y * sum_u3)
        + sum_u2 * (sum_uy * sum_u3 - sum_u2y * sum_u2);
    let det_b = n * (sum_uy * sum_u4 - sum_u2y * sum_u3) - sum_y * (sum_u * sum_u4 - sum_u2 * sum_u3)
        + sum_u2 * (sum_u * sum_u2y - sum_uy * sum_u2);
    let det_a = n * (sum_u2 * sum_u2y - sum_u3 * sum_uy) - sum_u * (sum_u * sum_u2y - sum_u2 * sum_uy)
        + sum_y * (sum_u * sum_u3 - sum_u2 * sum_u2);

    // Coefficients in the scaled variable u = (x - mean) / scale
    let qa = det_a / det;
    let qb = det_b / det;
    let qc = det_c / det;

    // Back to raw positions
    let a = qa / (scale * scale);
    let b = qb / scale - 2.0 * qa * mean / (scale * scale);
    let c = qa * mean * mean / (scale * scale) - qb * mean / scale + qc;

    let vertex_u = if qa.abs() > f64::EPSILON {
        -qb / (2.0 * qa)
    } else {
        0.0
    };
    let vertex = mean + vertex_u * scale;

    Some(FocusFit {
        coefficients: [a, b, c],
        vertex_position: vertex.round() as i32,
        predicted_fwhm: qa * vertex_u * vertex_u + qb * vertex_u + qc,
        concave_up: qa > 0.0,
    })
}

/// Lowest-FWHM sample, first one wins on ties
fn best_sample(samples: &[FocusSample]) -> Option<(i32, f64)> {
    samples
        .iter()
        .filter_map(|s| s.fwhm.map(|fwhm| (s.position, fwhm)))
        .fold(None, |best: Option<(i32, f64)>, (position, fwhm)| match best {
            Some((_, best_fwhm)) if best_fwhm <= fwhm => best,
            _ => Some((position, fwhm)),
        })
}

async fn move_focuser(focuser: &dyn FocuserPort, position: i32) -> SequencerResult<()> {
    focuser
        .move_to(position)
        .await
        .map_err(|e| SequencerError::device(format!("focuser move to {}", position), e))
}

fn check_stop(shutdown: &ShutdownToken, position: i32) -> SequencerResult<()> {
    if shutdown.is_requested() {
        tracing::info!(target: "autofocus", position, "Autofocus interrupted by termination request");
        return Err(SequencerError::Cancelled);
    }
    Ok(())
}

/// Capture a frame at the current focuser position and measure it.
/// Capture failures are errors; a frame the metrics cannot measure is a null sample.
/// No exposure is started once termination has been requested.
async fn sample_at(
    position: i32,
    camera: &dyn CameraPort,
    metrics: &dyn StarMetrics,
    settings: &AutofocusSettings,
    shutdown: &ShutdownToken,
) -> SequencerResult<FocusSample> {
    check_stop(shutdown, position)?;

    let output = scratch_frame_path(&settings.image_dir, &format!("focus-{}", position));
    let image = camera
        .capture(&settings.exposure, &output)
        .await
        .map_err(|e| SequencerError::device(format!("focus capture at {}", position), e))?;

    let sample = match metrics.measure(&image).await {
        Ok(measurement) => FocusSample {
            position,
            star_count: Some(measurement.star_count),
            fwhm: Some(measurement.fwhm),
        },
        Err(e) => {
            tracing::warn!(
                target: "autofocus",
                position,
                image = %image.display(),
                "Measurement failed, sample excluded from fit: {}",
                e
            );
            FocusSample {
                position,
                star_count: None,
                fwhm: None,
            }
        }
    };

    tracing::info!(
        target: "autofocus",
        position,
        stars = sample.star_count.unwrap_or(0),
        fwhm = sample.fwhm.unwrap_or(f64::NAN),
        "Position {}: stars {}, FWHM {}",
        position,
        sample.star_count.map_or("-".to_string(), |c| c.to_string()),
        sample.fwhm.map_or("-".to_string(), |f| format!("{:.2}", f))
    );

    Ok(sample)
}

/// Sweep the focuser across `[focus_min, focus_max]`, fit a parabola and
/// leave the focuser at the best position found.
pub async fn autofocus(
    focuser: &dyn FocuserPort,
    camera: &dyn CameraPort,
    metrics: &dyn StarMetrics,
    settings: &AutofocusSettings,
    shutdown: &ShutdownToken,
) -> SequencerResult<AutofocusResult> {
    let positions = sweep_positions(settings.focus_min, settings.focus_max, settings.step);
    if positions.is_empty() || settings.backlash_margin < 0 {
        return Err(SequencerError::Config(format!(
            "invalid focus sweep {}..{} step {} backlash {}",
            settings.focus_min, settings.focus_max, settings.step, settings.backlash_margin
        )));
    }

    let start = focuser
        .position()
        .await
        .map_err(|e| SequencerError::device("read focuser position", e))?;

    tracing::info!(
        target: "autofocus",
        start,
        "Autofocus from {}: sweep {}..{} step {} ({} positions), backlash margin {}",
        start,
        settings.focus_min,
        settings.focus_max,
        settings.step,
        positions.len(),
        settings.backlash_margin
    );

    // Range check: the far side of the sweep must be worse than where we are now
    let initial = sample_at(start, camera, metrics, settings, shutdown).await?;
    let approach = settings.approach_position();
    check_stop(shutdown, approach)?;
    move_focuser(focuser, approach).await?;
    let far = sample_at(approach, camera, metrics, settings, shutdown).await?;

    match (initial.fwhm, far.fwhm) {
        (Some(initial_fwhm), Some(far_fwhm)) if far_fwhm < initial_fwhm => {
            tracing::error!(
                target: "autofocus",
                initial_fwhm,
                far_fwhm,
                "FWHM at {} ({:.2}) better than at {} ({:.2}); focus lies outside the sweep",
                approach,
                far_fwhm,
                start,
                initial_fwhm
            );
            return Err(SequencerError::FocusOutOfRange {
                initial_fwhm,
                far_fwhm,
            });
        }
        (Some(_), Some(_)) => {}
        _ => {
            tracing::warn!(target: "autofocus", "Range check skipped, initial or far frame unmeasurable");
        }
    }

    let mut samples = Vec::with_capacity(positions.len());
    for &position in &positions {
        check_stop(shutdown, position)?;
        move_focuser(focuser, position).await?;
        samples.push(sample_at(position, camera, metrics, settings, shutdown).await?);
    }

    let (lowest_position, lowest_fwhm) = best_sample(&samples).ok_or_else(|| {
        tracing::error!(target: "autofocus", "No sample in the sweep produced a FWHM");
        SequencerError::FocusFailed(format!(
            "no stars measured at any of {} positions",
            samples.len()
        ))
    })?;

    let fit = fit_parabola(&samples);
    let (mut best_position, best_fwhm, used_fallback) = match &fit {
        Some(fit) if fit.concave_up => {
            tracing::info!(
                target: "autofocus",
                a = fit.coefficients[0],
                b = fit.coefficients[1],
                c = fit.coefficients[2],
                vertex = fit.vertex_position,
                predicted_fwhm = fit.predicted_fwhm,
                "Parabola fitted: vertex {} predicted FWHM {:.2}",
                fit.vertex_position,
                fit.predicted_fwhm
            );
            (fit.vertex_position, fit.predicted_fwhm, false)
        }
        Some(fit) => {
            tracing::warn!(
                target: "autofocus",
                a = fit.coefficients[0],
                "Fitted curve is concave down, using best sample {} (FWHM {:.2})",
                lowest_position,
                lowest_fwhm
            );
            (lowest_position, lowest_fwhm, true)
        }
        None => {
            tracing::warn!(
                target: "autofocus",
                "Too few samples to fit, using best sample {} (FWHM {:.2})",
                lowest_position,
                lowest_fwhm
            );
            (lowest_position, lowest_fwhm, true)
        }
    };

    if best_position < settings.focus_min || best_position > settings.focus_max {
        let clamped = best_position.clamp(settings.focus_min, settings.focus_max);
        tracing::warn!(
            target: "autofocus",
            vertex = best_position,
            clamped,
            "Fitted vertex {} outside sweep, clamped to {}",
            best_position,
            clamped
        );
        best_position = clamped;
    }

    move_focuser(focuser, approach).await?;
    move_focuser(focuser, best_position).await?;

    tracing::info!(
        target: "autofocus",
        best_position,
        best_fwhm,
        fallback = used_fallback,
        "Autofocus complete: position {}, FWHM {:.2}",
        best_position,
        best_fwhm
    );

    Ok(AutofocusResult {
        best_position,
        best_fwhm,
        fit,
        samples,
        used_fallback,
    })
}
