//! Plate solving with the ASTAP command line solver

use async_trait::async_trait;
use skywatch_sequencer::coordinates::{julian_day, precess_j2000_to_date};
use skywatch_sequencer::{DeviceError, DeviceResult, EquatorialCoordinate, PlateSolver};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const SOLUTION_MARKER: &str = "Solution found:";

pub struct AstapSolver {
    executable: PathBuf,
    /// Search radius in degrees
    search_radius: f64,
    timeout: Duration,
}

impl AstapSolver {
    pub fn new(executable: impl Into<PathBuf>, search_radius: f64, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            search_radius,
            timeout,
        }
    }
}

/// Parse three whitespace separated sexagesimal fields into a magnitude
fn sexagesimal_fields(text: &str) -> Option<f64> {
    let mut fields = text
        .split(|c: char| c.is_whitespace() || c == ':' || c == '°' || c == '\'' || c == '"')
        .filter(|f| !f.is_empty())
        .map(|f| f.parse::<f64>());
    let whole = fields.next()?.ok()?;
    let minutes = fields.next()?.ok()?;
    let seconds = fields.next()?.ok()?;
    if fields.next().is_some() || minutes >= 60.0 || seconds >= 60.0 {
        return None;
    }
    Some(whole + minutes / 60.0 + seconds / 3600.0)
}

/// J2000 solution from ASTAP's console output, e.g.
/// `Solution found: 05: 36 03.8	-05° 27 14`
pub fn parse_solution(output: &str) -> Option<EquatorialCoordinate> {
    let line = output.lines().find(|l| l.contains(SOLUTION_MARKER))?;
    let rest = &line[line.find(SOLUTION_MARKER)? + SOLUTION_MARKER.len()..];

    let sign_at = rest.find(['+', '-'])?;
    let (ra_text, dec_text) = rest.split_at(sign_at);
    let ra = sexagesimal_fields(ra_text)?;
    let negative = dec_text.starts_with('-');
    let dec = sexagesimal_fields(&dec_text[1..])?;

    EquatorialCoordinate::new(ra, if negative { -dec } else { dec })
}

#[async_trait]
impl PlateSolver for AstapSolver {
    async fn solve(&self, image: &Path) -> DeviceResult<EquatorialCoordinate> {
        tracing::debug!(target: "astap", "Solving {}", image.display());
        let run = Command::new(&self.executable)
            .arg("-f")
            .arg(image)
            .arg("-r")
            .arg(format!("{}", self.search_radius))
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                tracing::error!(target: "astap", "No solution for {} within {:?}", image.display(), self.timeout);
                DeviceError::timeout(format!("plate solve of {}", image.display()), self.timeout)
            })?
            .map_err(|e| {
                DeviceError::tool("astap", format!("failed to run {}: {}", self.executable.display(), e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(j2000) = parse_solution(&stdout) else {
            tracing::warn!(target: "astap", "No solution in ASTAP output: {}", stdout.trim());
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr
                .lines()
                .chain(stdout.lines())
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("no solution")
                .to_string();
            return Err(DeviceError::SolveFailed(format!(
                "{} (exit status {})",
                detail, output.status
            )));
        };

        let solved = precess_j2000_to_date(&j2000, julian_day(&chrono::Utc::now()));
        tracing::info!(target: "astap", "Solved {}: {} (J2000 {})", image.display(), solved, j2000);
        Ok(solved)
    }
}
