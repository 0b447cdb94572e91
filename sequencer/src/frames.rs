//! Output file naming for captured frames

use chrono::Utc;
use std::path::{Path, PathBuf};

/// First `capture-NNNNN.fits` in `dir` that does not exist yet
pub fn next_capture_path(dir: &Path) -> PathBuf {
    let mut index = 0u32;
    loop {
        let candidate = dir.join(format!("capture-{:05}.fits", index));
        if !candidate.exists() {
            return candidate;
        }
        index += 1;
    }
}

/// Scratch frame for alignment and focus, named by purpose and UTC time
pub fn scratch_frame_path(dir: &Path, purpose: &str) -> PathBuf {
    dir.join(format!(
        "{}-{}.fits",
        purpose,
        Utc::now().format("%Y%m%dT%H%M%S%.3f")
    ))
}
