//! Star detection through Siril's `findstar` command
//!
//! Each frame is copied into a private scratch directory which Siril uses as
//! its working directory, so concurrent sessions and odd file names never
//! interfere with the script.

use async_trait::async_trait;
use skywatch_sequencer::{DeviceError, DeviceResult, StarMeasurement, StarMetrics};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const SCRIPT: &str = "requires 1.2.0\nload frame\nfindstar\nclose\n";

pub struct SirilStarMetrics {
    executable: PathBuf,
    timeout: Duration,
}

impl SirilStarMetrics {
    pub fn new(executable: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout,
        }
    }
}

/// Star count and FWHM from a `findstar` report, e.g.
/// `Found 343 Gaussian profile stars in image, channel #0 (FWHM 5.428217)`
pub fn parse_findstar(output: &str) -> Option<StarMeasurement> {
    output.lines().find_map(|line| {
        let after_found = &line[line.find("Found ")? + "Found ".len()..];
        let (count, rest) = after_found.split_once(' ')?;
        if !rest.starts_with("Gaussian profile stars") {
            return None;
        }
        let star_count = count.parse::<u32>().ok()?;
        let after_fwhm = &rest[rest.find("(FWHM ")? + "(FWHM ".len()..];
        let fwhm = after_fwhm[..after_fwhm.find(')')?].trim().parse::<f64>().ok()?;
        Some(StarMeasurement { star_count, fwhm })
    })
}

#[async_trait]
impl StarMetrics for SirilStarMetrics {
    async fn measure(&self, image: &Path) -> DeviceResult<StarMeasurement> {
        let scratch = tempfile::Builder::new()
            .prefix("skywatch-findstar")
            .tempdir()
            .map_err(|e| DeviceError::tool("siril", format!("scratch directory: {}", e)))?;
        tokio::fs::copy(image, scratch.path().join("frame.fits"))
            .await
            .map_err(|e| DeviceError::tool("siril", format!("copy {}: {}", image.display(), e)))?;

        let mut child = Command::new(&self.executable)
            .arg("-d")
            .arg(scratch.path())
            .args(["-s", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DeviceError::tool("siril", format!("failed to run {}: {}", self.executable.display(), e))
            })?;

        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(SCRIPT.as_bytes())
                    .await
                    .map_err(|e| DeviceError::tool("siril", format!("write script: {}", e)))?;
            }
            child
                .wait_with_output()
                .await
                .map_err(|e| DeviceError::tool("siril", e.to_string()))
        };
        let output = tokio::time::timeout(self.timeout, run).await.map_err(|_| {
            tracing::warn!(target: "siril", "findstar on {} still running after {:?}", image.display(), self.timeout);
            DeviceError::timeout(format!("star detection on {}", image.display()), self.timeout)
        })??;
        let stdout = String::from_utf8_lossy(&output.stdout);

        match parse_findstar(&stdout) {
            Some(m) if m.star_count == 0 => Err(DeviceError::NoStarsFound),
            Some(m) => {
                tracing::debug!(
                    target: "siril",
                    "{}: {} stars, FWHM {:.2}",
                    image.display(),
                    m.star_count,
                    m.fwhm
                );
                Ok(m)
            }
            None if stdout.to_lowercase().contains("no star") => Err(DeviceError::NoStarsFound),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(target: "siril", "No findstar report for {}: {}", image.display(), stdout.trim());
                Err(DeviceError::tool(
                    "siril",
                    format!("no findstar report (exit status {}): {}", output.status, stderr.trim()),
                ))
            }
        }
    }
}
