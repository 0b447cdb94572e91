//! Checks run before the mount is unparked
//!
//! Each problem found is put to the operator, who either aborts the session or
//! overrides and continues. A probe that cannot answer is logged and skipped.

use crate::config::PreflightConfig;
use crate::error::{DeviceResult, SequencerError, SequencerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceEvent {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[async_trait]
pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes available to an unprivileged user on the filesystem holding `path`
    async fn free_bytes(&self, path: &Path) -> DeviceResult<u64>;
}

#[async_trait]
pub trait MaintenanceCalendar: Send + Sync {
    /// Events starting within `horizon` from now
    async fn upcoming(&self, horizon: Duration) -> DeviceResult<Vec<MaintenanceEvent>>;
}

#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Ask whether to abort because of `reason`; `true` means abort
    async fn confirm_abort(&self, reason: &str) -> bool;
}

/// Everything the preflight checks need; the calendar is optional
pub struct PreflightPorts<'a> {
    pub disk: &'a dyn DiskSpaceProbe,
    pub calendar: Option<&'a dyn MaintenanceCalendar>,
    pub prompt: &'a dyn OperatorPrompt,
}

async fn ask(prompt: &dyn OperatorPrompt, reason: String) -> SequencerResult<()> {
    if prompt.confirm_abort(&reason).await {
        tracing::warn!(target: "preflight", "Operator aborted: {}", reason);
        Err(SequencerError::OperatorDeclined(reason))
    } else {
        tracing::warn!(target: "preflight", "Operator override, continuing despite: {}", reason);
        Ok(())
    }
}

pub async fn run_preflight(
    config: &PreflightConfig,
    capture_dir: &Path,
    ports: &PreflightPorts<'_>,
) -> SequencerResult<()> {
    let min_free = config.min_free_bytes();
    match ports.disk.free_bytes(capture_dir).await {
        Ok(free) if free < min_free => {
            let free_gib = free as f64 / (1024.0 * 1024.0 * 1024.0);
            tracing::warn!(
                target: "preflight",
                free_bytes = free,
                min_bytes = min_free,
                "Low disk space: {:.2} GiB free",
                free_gib
            );
            ask(
                ports.prompt,
                format!(
                    "low disk space: {:.2} GiB free, {:.0} GiB wanted",
                    free_gib, config.min_free_gib
                ),
            )
            .await?;
        }
        Ok(free) => {
            tracing::info!(target: "preflight", free_bytes = free, "Disk space OK");
        }
        Err(e) => {
            tracing::warn!(target: "preflight", "Disk space check skipped: {}", e);
        }
    }

    let Some(calendar) = ports.calendar else {
        tracing::debug!(target: "preflight", "No maintenance calendar configured");
        return Ok(());
    };

    let horizon = config.maintenance_horizon();
    match calendar.upcoming(horizon).await {
        Ok(events) => {
            let cutoff = Utc::now()
                + chrono::Duration::from_std(horizon).unwrap_or_else(|_| chrono::Duration::hours(12));
            let mut found = false;
            for event in events.into_iter().filter(|e| e.start < cutoff) {
                found = true;
                tracing::warn!(
                    target: "preflight",
                    event = %event.name,
                    start = %event.start,
                    end = %event.end,
                    "Maintenance event within {:.0}h",
                    config.maintenance_horizon_hours
                );
                ask(
                    ports.prompt,
                    format!(
                        "maintenance event '{}' from {} to {}",
                        event.name,
                        event.start.format("%Y-%m-%d %H:%M UTC"),
                        event.end.format("%H:%M UTC")
                    ),
                )
                .await?;
            }
            if !found {
                tracing::info!(target: "preflight", "No upcoming maintenance events");
            }
        }
        Err(e) => {
            tracing::warn!(target: "preflight", "Maintenance calendar check skipped: {}", e);
        }
    }

    Ok(())
}
