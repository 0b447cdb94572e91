//! Error taxonomy for device ports and the session
//!
//! `DeviceError` is what a port returns; the calling algorithm decides whether
//! it is fatal. `SequencerError` is what the algorithms and the session return.

use std::time::Duration;
use thiserror::Error;

/// Typed failure returned by every port
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("device busy: {0}")]
    Busy(String),

    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("device rejected '{command}': {reason}")]
    Rejected { command: String, reason: String },

    #[error("plate solve failed: {0}")]
    SolveFailed(String),

    #[error("no stars found")]
    NoStarsFound,

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },
}

impl DeviceError {
    /// Timeouts and momentary busy/disconnect conditions are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeviceError::Timeout { .. } | DeviceError::Busy(_) | DeviceError::Disconnected(_)
        )
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        DeviceError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn rejected(command: impl Into<String>, reason: impl Into<String>) -> Self {
        DeviceError::Rejected {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Result type for port operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Session and algorithm level errors
#[derive(Debug, Clone, Error)]
pub enum SequencerError {
    #[error("{operation} failed: {source}")]
    Device {
        operation: String,
        #[source]
        source: DeviceError,
    },

    #[error("plate solve failed on alignment iteration {iteration}: {reason}")]
    SolveFailed { iteration: u32, reason: String },

    #[error("alignment did not converge after {iterations} iterations (last error {last_error_arcsec:.1}\")")]
    AlignmentNotConverged {
        iterations: u32,
        last_error_arcsec: f64,
    },

    #[error("focus optimum outside requested range: far point FWHM {far_fwhm:.2} better than initial {initial_fwhm:.2}")]
    FocusOutOfRange { initial_fwhm: f64, far_fwhm: f64 },

    #[error("autofocus failed: {0}")]
    FocusFailed(String),

    #[error("mount status unknown for {polls} consecutive polls")]
    MountUnresponsive { polls: u32 },

    #[error("meridian flip failed: {0}")]
    FlipFailed(String),

    #[error("operator aborted: {0}")]
    OperatorDeclined(String),

    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl SequencerError {
    pub fn device(operation: impl Into<String>, source: DeviceError) -> Self {
        SequencerError::Device {
            operation: operation.into(),
            source,
        }
    }

    /// Whether the error should end the session with a failure exit code
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SequencerError::Cancelled)
    }
}

/// Result type for sequencer operations
pub type SequencerResult<T> = Result<T, SequencerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DeviceError::timeout("read RASTATUS", Duration::from_secs(2)).is_transient());
        assert!(DeviceError::Busy("focuser".to_string()).is_transient());
        assert!(!DeviceError::rejected("goto", "below horizon").is_transient());
        assert!(!DeviceError::NoStarsFound.is_transient());
        assert!(!DeviceError::SolveFailed("no solution".to_string()).is_transient());
    }

    #[test]
    fn test_error_messages_are_single_line() {
        let err = SequencerError::device(
            "goto",
            DeviceError::rejected("EQUATORIAL_EOD_COORD RA=5.5 DEC=-5", "Alert"),
        );
        let msg = err.to_string();
        assert!(msg.contains("goto failed"));
        assert!(msg.contains("RA=5.5"));
        assert!(!msg.contains('\n'));

        let err = SequencerError::AlignmentNotConverged {
            iterations: 10,
            last_error_arcsec: 42.31,
        };
        assert!(err.to_string().contains("42.3"));
    }

    #[test]
    fn test_cancelled_is_not_fatal() {
        assert!(!SequencerError::Cancelled.is_fatal());
        assert!(SequencerError::OperatorDeclined("disk".to_string()).is_fatal());
    }
}
