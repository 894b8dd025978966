//! Driver status codes and error handling.
//!
//! Drivers report failures as negative errno-style integers. This module
//! converts them into [`HalStatus`] and the richer [`HalError`], and decides
//! which failures are transient.

use std::fmt;
use thiserror::Error;

/// Status codes returned by the device driver.
///
/// Values follow the negative-errno convention used by poll-mode drivers.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalStatus {
    Success = 0,
    Failure = -1,
    NotFound = -2,
    Again = -11,
    NoMemory = -12,
    Busy = -16,
    AlreadyExists = -17,
    NoDevice = -19,
    InvalidParameter = -22,
    TableFull = -28,
    NotSupported = -95,
    Timeout = -110,
    NotStarted = -107,
}

impl HalStatus {
    /// Creates a HalStatus from a raw driver return value.
    pub fn from_raw(status: i32) -> Self {
        match status {
            0 => HalStatus::Success,
            -2 => HalStatus::NotFound,
            -11 => HalStatus::Again,
            -12 => HalStatus::NoMemory,
            -16 => HalStatus::Busy,
            -17 => HalStatus::AlreadyExists,
            -19 => HalStatus::NoDevice,
            -22 => HalStatus::InvalidParameter,
            -28 => HalStatus::TableFull,
            -95 => HalStatus::NotSupported,
            -107 => HalStatus::NotStarted,
            -110 => HalStatus::Timeout,
            _ => HalStatus::Failure,
        }
    }

    /// Returns the raw driver value.
    pub fn as_raw(&self) -> i32 {
        *self as i32
    }

    /// Returns true if the status indicates success.
    pub fn is_success(&self) -> bool {
        *self == HalStatus::Success
    }

    /// Returns true if the status indicates an error.
    pub fn is_error(&self) -> bool {
        *self != HalStatus::Success
    }

    /// Converts to a Result, returning Ok(()) for success.
    pub fn into_result(self) -> HalResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(HalError::from_status(self))
        }
    }
}

impl fmt::Display for HalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HalStatus::Success => "success",
            HalStatus::Failure => "operation failed",
            HalStatus::NotFound => "no such object",
            HalStatus::Again => "resource temporarily unavailable",
            HalStatus::NoMemory => "out of memory",
            HalStatus::Busy => "device or resource busy",
            HalStatus::AlreadyExists => "object exists",
            HalStatus::NoDevice => "no such device",
            HalStatus::InvalidParameter => "invalid argument",
            HalStatus::TableFull => "no space left in table",
            HalStatus::NotSupported => "operation not supported",
            HalStatus::NotStarted => "device not started",
            HalStatus::Timeout => "timed out",
        };
        write!(f, "{} ({})", s, self.as_raw())
    }
}

/// Error type for hardware operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    /// The driver returned an error status.
    #[error("driver operation failed: {status}")]
    Status { status: HalStatus },

    /// The requested feature is not supported by the device.
    #[error("feature not supported: {feature}")]
    NotSupported { feature: String },

    /// Invalid parameter passed to the driver.
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// The requested object was not found.
    #[error("not found: {item}")]
    NotFound { item: String },

    /// The object is in the wrong lifecycle state for the operation.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// A hardware table is full.
    #[error("table full: {table}")]
    TableFull { table: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl HalError {
    /// Creates an error from a driver status code.
    pub fn from_status(status: HalStatus) -> Self {
        match status {
            HalStatus::Success => HalError::Internal {
                message: "from_status called with success status".to_string(),
            },
            HalStatus::NotSupported => HalError::NotSupported {
                feature: "unknown".to_string(),
            },
            HalStatus::InvalidParameter => HalError::InvalidParameter {
                message: format!("driver returned {}", status),
            },
            HalStatus::NotFound | HalStatus::NoDevice => HalError::NotFound {
                item: format!("driver returned {}", status),
            },
            HalStatus::TableFull => HalError::TableFull {
                table: "unknown".to_string(),
            },
            HalStatus::NotStarted => HalError::InvalidState {
                message: format!("driver returned {}", status),
            },
            _ => HalError::Status { status },
        }
    }

    /// Creates a not supported error with a feature description.
    pub fn not_supported(feature: impl Into<String>) -> Self {
        HalError::NotSupported {
            feature: feature.into(),
        }
    }

    /// Creates an invalid parameter error with a message.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        HalError::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates a not found error with an item description.
    pub fn not_found(item: impl Into<String>) -> Self {
        HalError::NotFound { item: item.into() }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        HalError::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a table full error.
    pub fn table_full(table: impl Into<String>) -> Self {
        HalError::TableFull {
            table: table.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        HalError::Internal {
            message: message.into(),
        }
    }

    /// Returns the underlying driver status if this is a Status error.
    pub fn status(&self) -> Option<HalStatus> {
        match self {
            HalError::Status { status } => Some(*status),
            _ => None,
        }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HalError::Status {
                status: HalStatus::Again
                    | HalStatus::Busy
                    | HalStatus::NoMemory
                    | HalStatus::Timeout
            }
        )
    }
}

/// Result type for hardware operations.
pub type HalResult<T> = Result<T, HalError>;

/// Extension trait for converting raw driver return codes.
pub trait HalStatusExt {
    /// Converts a raw return code to a Result.
    fn to_result(self) -> HalResult<()>;
}

impl HalStatusExt for i32 {
    fn to_result(self) -> HalResult<()> {
        if self >= 0 {
            Ok(())
        } else {
            HalStatus::from_raw(self).into_result()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_success() {
        assert!(HalStatus::Success.is_success());
        assert!(!HalStatus::Success.is_error());
        assert!(HalStatus::Success.into_result().is_ok());
    }

    #[test]
    fn test_status_from_raw() {
        assert_eq!(HalStatus::from_raw(0), HalStatus::Success);
        assert_eq!(HalStatus::from_raw(-22), HalStatus::InvalidParameter);
        assert_eq!(HalStatus::from_raw(-999), HalStatus::Failure);
    }

    #[test]
    fn test_error_from_status() {
        let err = HalError::from_status(HalStatus::NotFound);
        assert!(matches!(err, HalError::NotFound { .. }));

        let err = HalError::from_status(HalStatus::TableFull);
        assert!(matches!(err, HalError::TableFull { .. }));

        let err = HalError::from_status(HalStatus::NotStarted);
        assert!(matches!(err, HalError::InvalidState { .. }));
    }

    #[test]
    fn test_raw_status_to_result() {
        assert!(0_i32.to_result().is_ok());
        assert!(3_i32.to_result().is_ok());
        assert!((-12_i32).to_result().is_err());
    }

    #[test]
    fn test_error_retryable() {
        assert!(HalError::from_status(HalStatus::Busy).is_retryable());
        assert!(HalError::from_status(HalStatus::Timeout).is_retryable());
        assert!(!HalError::from_status(HalStatus::NotFound).is_retryable());
        assert!(!HalError::invalid_parameter("bad queue").is_retryable());
    }
}
