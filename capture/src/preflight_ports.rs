//! Preflight probes: free disk space, the Rachio irrigation calendar and the
//! operator's terminal

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use skywatch_sequencer::{
    DeviceError, DeviceResult, DiskSpaceProbe, MaintenanceCalendar, MaintenanceEvent, OperatorPrompt,
};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

// =============================================================================
// DISK SPACE
// =============================================================================

/// Free space as reported by POSIX `df`
pub struct DfDiskProbe;

/// Available bytes from `df -Pk` output (second line, fourth column, KiB)
pub fn parse_df_available(output: &str) -> Option<u64> {
    let line = output.lines().nth(1)?;
    let kib = line.split_whitespace().nth(3)?.parse::<u64>().ok()?;
    kib.checked_mul(1024)
}

#[async_trait]
impl DiskSpaceProbe for DfDiskProbe {
    async fn free_bytes(&self, path: &Path) -> DeviceResult<u64> {
        let output = Command::new("df")
            .arg("-Pk")
            .arg(path)
            .output()
            .await
            .map_err(|e| DeviceError::tool("df", e.to_string()))?;
        if !output.status.success() {
            return Err(DeviceError::tool(
                "df",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_df_available(&stdout)
            .ok_or_else(|| DeviceError::tool("df", format!("unexpected output: {}", stdout.trim())))
    }
}

// =============================================================================
// RACHIO CALENDAR
// =============================================================================

const RACHIO_API: &str = "https://api.rach.io/1/public";
const RACHIO_EVENTS: &str = "https://cloud-rest.rach.io/events/upcoming";
const RACHIO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct PersonInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Person {
    #[serde(default)]
    devices: Vec<RachioDevice>,
}

#[derive(Debug, Deserialize)]
struct RachioDevice {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UpcomingEvents {
    #[serde(default)]
    entries: Vec<RachioEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RachioEvent {
    schedule_name: Option<String>,
    summary: Option<String>,
    start_time: String,
    end_time: String,
}

fn parse_time(value: &str) -> DeviceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DeviceError::tool("rachio", format!("bad timestamp '{}': {}", value, e)))
}

/// Convert the `events/upcoming` response body into maintenance events
pub fn parse_upcoming(body: &str) -> DeviceResult<Vec<MaintenanceEvent>> {
    let upcoming: UpcomingEvents = serde_json::from_str(body)
        .map_err(|e| DeviceError::tool("rachio", format!("bad response: {}", e)))?;
    upcoming
        .entries
        .into_iter()
        .map(|event| {
            Ok(MaintenanceEvent {
                name: event
                    .schedule_name
                    .or(event.summary)
                    .unwrap_or_else(|| "Unnamed schedule".to_string()),
                start: parse_time(&event.start_time)?,
                end: parse_time(&event.end_time)?,
            })
        })
        .collect()
}

fn http_error(err: reqwest::Error) -> DeviceError {
    if err.is_timeout() {
        DeviceError::timeout("Rachio request", RACHIO_TIMEOUT)
    } else if err.is_connect() {
        DeviceError::Disconnected(format!("Rachio: {}", err))
    } else {
        DeviceError::tool("rachio", err.to_string())
    }
}

/// Upcoming watering from the first controller on a Rachio account
pub struct RachioCalendar {
    client: Client,
    api_key: String,
}

impl RachioCalendar {
    pub fn new(api_key: impl Into<String>) -> DeviceResult<Self> {
        let client = Client::builder()
            .timeout(RACHIO_TIMEOUT)
            .build()
            .map_err(http_error)?;
        Ok(Self {
            client,
            api_key: api_key.into(),
        })
    }

    /// Read the API key from a file, trimming surrounding whitespace
    pub fn from_key_file(path: &Path) -> DeviceResult<Self> {
        let key = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::tool("rachio", format!("read {}: {}", path.display(), e)))?;
        Self::new(key.trim())
    }

    async fn device_id(&self) -> DeviceResult<String> {
        let info: PersonInfo = self
            .client
            .get(format!("{}/person/info", RACHIO_API))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_error)?
            .json()
            .await
            .map_err(http_error)?;

        let person: Person = self
            .client
            .get(format!("{}/person/{}", RACHIO_API, info.id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_error)?
            .json()
            .await
            .map_err(http_error)?;

        person
            .devices
            .into_iter()
            .next()
            .map(|d| d.id)
            .ok_or_else(|| DeviceError::tool("rachio", "account has no controllers"))
    }
}

#[async_trait]
impl MaintenanceCalendar for RachioCalendar {
    async fn upcoming(&self, horizon: Duration) -> DeviceResult<Vec<MaintenanceEvent>> {
        let device_id = self.device_id().await?;
        let hours_ahead = (horizon.as_secs_f64() / 3600.0).ceil().max(1.0) as u64;
        tracing::debug!(target: "preflight", "Fetching Rachio events {}h ahead for {}", hours_ahead, device_id);

        let body = self
            .client
            .post(RACHIO_EVENTS)
            .bearer_auth(&self.api_key)
            .json(&json!({ "device_id": device_id, "hours_ahead": hours_ahead }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_error)?
            .text()
            .await
            .map_err(http_error)?;
        parse_upcoming(&body)
    }
}

// =============================================================================
// OPERATOR PROMPT
// =============================================================================

/// Asks on stdout and reads the answer from stdin. A closed stdin aborts.
pub struct TerminalPrompt;

#[async_trait]
impl OperatorPrompt for TerminalPrompt {
    async fn confirm_abort(&self, reason: &str) -> bool {
        {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "\n{}", reason);
            let _ = write!(stdout, "Abort? (y/n) ");
            let _ = stdout.flush();
        }
        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(0) | Err(_) => {
                tracing::warn!(target: "preflight", "No operator answer, aborting");
                true
            }
            Ok(_) => line.trim().eq_ignore_ascii_case("y"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_df() {
        let output = "Filesystem     1024-blocks      Used Available Capacity Mounted on\n\
                      /dev/nvme0n1p2   960303848 412345678 499123456      46% /home\n";
        assert_eq!(parse_df_available(output), Some(499_123_456 * 1024));
        assert_eq!(parse_df_available("Filesystem 1024-blocks Used Available\n"), None);
    }

    #[test]
    fn test_parse_upcoming_events() {
        let body = r#"{
            "entries": [
                {
                    "scheduleName": "Front lawn",
                    "summary": "Front lawn - 3 zones",
                    "startTime": "2024-05-01T11:00:00Z",
                    "endTime": "2024-05-01T11:45:00Z"
                },
                {
                    "summary": "Drip line",
                    "startTime": "2024-05-02T05:30:00.000-05:00",
                    "endTime": "2024-05-02T06:00:00.000-05:00"
                }
            ]
        }"#;
        let events = parse_upcoming(body).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "Front lawn");
        assert_eq!(events[0].start.to_rfc3339(), "2024-05-01T11:00:00+00:00");
        assert_eq!(events[1].name, "Drip line");
        assert_eq!(events[1].start.to_rfc3339(), "2024-05-02T10:30:00+00:00");
        assert_eq!(events[1].end - events[1].start, chrono::Duration::minutes(30));
    }

    #[test]
    fn test_parse_empty_and_bad_bodies() {
        assert!(parse_upcoming(r#"{"entries": []}"#).unwrap().is_empty());
        assert!(parse_upcoming("{}").unwrap().is_empty());
        assert!(parse_upcoming("<html>").is_err());
        let bad_time = r#"{"entries":[{"scheduleName":"x","startTime":"soon","endTime":"later"}]}"#;
        assert!(parse_upcoming(bad_time).is_err());
    }
}
