//! Unified error handling for rocflash
//!
//! Every fallible operation in the crate returns [`FlashResult`]. Errors are
//! grouped into categories that tell the calling framework what it can do
//! about them:
//! - User errors (malformed descriptors or configuration, fix and call again)
//! - Unsupported configurations (no compiled kernel variant, never retry)
//! - Device errors (runtime unavailable or asynchronous execution failure)
//! - Internal errors (bugs)

use std::fmt;

/// Unified error type for rocflash
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlashError {
    /// Descriptor fields are malformed (shapes, strides, probabilities, buffers).
    /// Detected before any work is enqueued.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// No compiled kernel variant covers the requested head dim, dtype,
    /// mask mode and hardware class.
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// An enqueued kernel failed while the stream was executing.
    /// Only reported at a synchronization point.
    #[error("Device execution failure in {kernel}: {reason}")]
    DeviceExecutionFailure { kernel: String, reason: String },

    /// HIP runtime has no usable device
    #[error("GPU device not available: {0}")]
    DeviceUnavailable(String),

    /// Malformed runtime configuration (environment or builder values)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Lock poisoned (indicates a bug in a kernel closure)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl FlashError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            FlashError::InvalidParameters(_) | FlashError::InvalidConfiguration(_) => {
                ErrorCategory::User
            }
            FlashError::UnsupportedConfiguration(_) => ErrorCategory::Unsupported,
            FlashError::DeviceExecutionFailure { .. } | FlashError::DeviceUnavailable(_) => {
                ErrorCategory::Device
            }
            FlashError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this is a user-facing error (fix the input and call again)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this error invalidates the in-flight batch.
    ///
    /// Output buffers must not be trusted after a fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FlashError::DeviceExecutionFailure { .. } | FlashError::LockPoisoned(_)
        )
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration
    User,
    /// No kernel variant exists, retrying cannot help
    Unsupported,
    /// GPU runtime or execution failure
    Device,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Unsupported => write!(f, "Unsupported"),
            ErrorCategory::Device => write!(f, "Device"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for FlashError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        FlashError::LockPoisoned(err.to_string())
    }
}

/// Helper type alias for Results using FlashError
pub type FlashResult<T> = std::result::Result<T, FlashError>;

/// Create an `InvalidParameters` error with context
///
/// # Examples
/// ```ignore
/// return Err(invalid_params!("seqlen_q must be positive, got {}", seqlen_q));
/// ```
#[macro_export]
macro_rules! invalid_params {
    ($msg:expr) => {
        $crate::error::FlashError::InvalidParameters($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FlashError::InvalidParameters(format!($fmt, $($arg)*))
    };
}
