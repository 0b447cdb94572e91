//! INDI error types
//!
//! Provides structured error types for INDI operations.

use std::fmt;
use std::time::Duration;

/// INDI client errors
#[derive(Debug, Clone)]
pub enum IndiError {
    /// Connection to INDI server failed
    ConnectionFailed(String),
    /// Connection timeout with context
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    /// Operation timeout with detailed context
    OperationTimeout {
        operation: String,
        device: String,
        duration: Duration,
        context: String,
    },
    /// Property did not leave the Busy state in time
    PropertyTimeout {
        device: String,
        property: String,
        duration: Duration,
        last_state: Option<String>,
    },
    /// No image BLOB arrived for an exposure
    BlobTimeout { device: String, duration: Duration },
    /// XML parse error
    ParseError(String),
    /// Element value could not be interpreted
    InvalidValue {
        device: String,
        property: String,
        element: String,
        value: String,
    },
    /// Property not found
    PropertyNotFound { device: String, property: String },
    /// Permission denied (attempted to write to read-only property)
    PermissionDenied(String),
    /// Device reported the Alert state for a property
    DeviceAlert(String),
    /// Send channel closed
    ChannelClosed(String),
    /// Not connected to server
    NotConnected,
    /// Local file I/O error (writing captured frames)
    Io(String),
}

impl IndiError {
    /// Failures that may clear up on their own if the read or command is repeated
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndiError::ConnectionTimeout { .. }
                | IndiError::OperationTimeout { .. }
                | IndiError::PropertyTimeout { .. }
                | IndiError::BlobTimeout { .. }
                | IndiError::PropertyNotFound { .. }
        )
    }

    /// How long the operation waited, for the timeout variants
    pub fn timeout_duration(&self) -> Option<Duration> {
        match self {
            IndiError::ConnectionTimeout { duration, .. }
            | IndiError::OperationTimeout { duration, .. }
            | IndiError::PropertyTimeout { duration, .. }
            | IndiError::BlobTimeout { duration, .. } => Some(*duration),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout_duration().is_some()
    }
}

impl std::error::Error for IndiError {}

impl fmt::Display for IndiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndiError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            IndiError::ConnectionTimeout { host, port, duration } => {
                write!(
                    f,
                    "Connection timeout: failed to connect to {}:{} after {:?}",
                    host, port, duration
                )
            }
            IndiError::OperationTimeout {
                operation,
                device,
                duration,
                context,
            } => {
                write!(
                    f,
                    "Operation '{}' timed out on device {} after {:?}: {}",
                    operation, device, duration, context
                )
            }
            IndiError::PropertyTimeout {
                device,
                property,
                duration,
                last_state,
            } => {
                let state = last_state.as_deref().unwrap_or("unknown");
                write!(
                    f,
                    "Property {}.{} still busy after {:?} (last state: {})",
                    device, property, duration, state
                )
            }
            IndiError::BlobTimeout { device, duration } => {
                write!(f, "No image received from {} after {:?}", device, duration)
            }
            IndiError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            IndiError::InvalidValue {
                device,
                property,
                element,
                value,
            } => write!(
                f,
                "Invalid value '{}' for {}.{}.{}",
                value, device, property, element
            ),
            IndiError::PropertyNotFound { device, property } => {
                write!(f, "Property not found: {}.{}", device, property)
            }
            IndiError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            IndiError::DeviceAlert(msg) => write!(f, "Device alert: {}", msg),
            IndiError::ChannelClosed(msg) => write!(f, "Channel closed: {}", msg),
            IndiError::NotConnected => write!(f, "Not connected to INDI server"),
            IndiError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl From<std::io::Error> for IndiError {
    fn from(err: std::io::Error) -> Self {
        IndiError::Io(err.to_string())
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn busy_focuser() -> IndiError {
        IndiError::PropertyTimeout {
            device: "ZWO EAF".to_string(),
            property: "ABS_FOCUS_POSITION".to_string(),
            duration: Duration::from_secs(120),
            last_state: Some("Busy".to_string()),
        }
    }

    #[test]
    fn test_display_names_device_and_property() {
        assert_eq!(
            busy_focuser().to_string(),
            "Property ZWO EAF.ABS_FOCUS_POSITION still busy after 120s (last state: Busy)"
        );
        let err = IndiError::InvalidValue {
            device: "EQMod Mount".to_string(),
            property: "TELESCOPE_PIER_SIDE".to_string(),
            element: "PIER_EAST".to_string(),
            value: "sideways".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value 'sideways' for EQMod Mount.TELESCOPE_PIER_SIDE.PIER_EAST"
        );
    }

    #[test]
    fn test_blob_timeout_display() {
        let err = IndiError::BlobTimeout {
            device: "ZWO CCD ASI2600MM Pro".to_string(),
            duration: Duration::from_secs(330),
        };
        assert_eq!(
            err.to_string(),
            "No image received from ZWO CCD ASI2600MM Pro after 330s"
        );
    }

    #[test]
    fn test_timeouts_are_transient() {
        let goto = IndiError::OperationTimeout {
            operation: "goto".to_string(),
            device: "EQMod Mount".to_string(),
            duration: Duration::from_secs(300),
            context: "did not settle".to_string(),
        };
        assert!(goto.is_transient() && goto.is_timeout());
        assert_eq!(goto.timeout_duration(), Some(Duration::from_secs(300)));
        assert!(busy_focuser().is_transient() && busy_focuser().is_timeout());
    }

    #[test]
    fn test_missing_property_is_transient_but_not_a_timeout() {
        let err = IndiError::PropertyNotFound {
            device: "EQMod Mount".to_string(),
            property: "TIME_LST".to_string(),
        };
        assert!(err.is_transient());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_hard_failures_are_not_transient() {
        for err in [
            IndiError::DeviceAlert("EQMod Mount.EQUATORIAL_EOD_COORD".to_string()),
            IndiError::PermissionDenied("TIME_LST is read-only".to_string()),
            IndiError::NotConnected,
            IndiError::ChannelClosed("writer".to_string()),
            IndiError::Io("disk full".to_string()),
        ] {
            assert!(!err.is_transient(), "{}", err);
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let err: IndiError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(err.to_string(), "I/O error: disk full");
    }
}
