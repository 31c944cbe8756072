//! Crypto engine front-end error types

use thiserror::Error;

use crate::config::ConfigError;

/// Result type for crypto engine operations
pub type CeResult<T> = Result<T, CeError>;

/// errno values a character-device front-end reports for each error class
pub mod errno {
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOTTY: i32 = 25;
    pub const EIO: i32 = 5;
    pub const ETIMEDOUT: i32 = 110;
}

/// Anomaly classes recognised in the engine status registers after a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwAnomaly {
    /// Pipe key lifetime timer expired
    KeyTimerExpired,
    /// Pipe key usage paused by the security domain
    KeyPaused,
    /// Engine raised its generic error interrupt
    GenericError,
}

impl HwAnomaly {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            HwAnomaly::KeyTimerExpired => "key timer expired",
            HwAnomaly::KeyPaused => "key paused",
            HwAnomaly::GenericError => "generic error",
        }
    }
}

impl std::fmt::Display for HwAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors that can occur while validating, scheduling or completing a request
#[derive(Error, Debug)]
pub enum CeError {
    /// Malformed descriptor, size mismatch or overflow
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Scratch buffer allocation failed
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Copy to or from caller memory failed
    #[error("Bad user buffer at 0x{vaddr:x} ({len} bytes)")]
    UserBufferFault { vaddr: u64, len: usize },

    /// Engine refused the submission synchronously
    #[error("Engine dispatch failed: {0}")]
    DispatchFailed(String),

    /// Engine accepted the job but completed it with a fault
    #[error("Engine I/O error: {0}")]
    Io(String),

    /// Bounded wait expired and status showed no specific anomaly
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Bounded wait expired and status classification found an anomaly
    #[error("Hardware anomaly after timeout: {0}")]
    HardwareAnomaly(HwAnomaly),

    /// Operation called in the wrong session state
    #[error("Usage error: {0}")]
    Usage(String),

    /// Engine lacks the capability
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Device has been torn down
    #[error("Device closed")]
    DeviceClosed,
}

impl CeError {
    /// Build an `InvalidArgument` from anything printable
    pub fn invalid(msg: impl Into<String>) -> Self {
        CeError::InvalidArgument(msg.into())
    }

    /// Map to the errno value returned by the ioctl surface
    pub fn errno(&self) -> i32 {
        match self {
            CeError::InvalidArgument(_) | CeError::Usage(_) | CeError::Config(_) => errno::EINVAL,
            CeError::OutOfMemory { .. } => errno::ENOMEM,
            CeError::UserBufferFault { .. } => errno::EFAULT,
            CeError::DispatchFailed(_) | CeError::Io(_) | CeError::HardwareAnomaly(_) => errno::EIO,
            CeError::Timeout { .. } => errno::ETIMEDOUT,
            CeError::NotSupported(_) => errno::ENOTTY,
            CeError::DeviceClosed => errno::ENODEV,
        }
    }

    /// Check if the caller may retry the same request
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CeError::Timeout { .. } | CeError::HardwareAnomaly(_) | CeError::DispatchFailed(_)
        )
    }

    /// Check if this error came from a bad descriptor
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, CeError::InvalidArgument(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(CeError::invalid("x").errno(), errno::EINVAL);
        assert_eq!(CeError::OutOfMemory { requested: 4 }.errno(), errno::ENOMEM);
        assert_eq!(CeError::UserBufferFault { vaddr: 0, len: 1 }.errno(), errno::EFAULT);
        assert_eq!(CeError::HardwareAnomaly(HwAnomaly::KeyPaused).errno(), errno::EIO);
        assert_eq!(CeError::Timeout { timeout_ms: 1500 }.errno(), errno::ETIMEDOUT);
        assert_eq!(CeError::NotSupported("cmac".into()).errno(), errno::ENOTTY);
    }

    #[test]
    fn test_recoverable() {
        assert!(CeError::Timeout { timeout_ms: 1 }.is_recoverable());
        assert!(!CeError::invalid("bad").is_recoverable());
        assert!(CeError::invalid("bad").is_invalid_argument());
    }

    #[test]
    fn test_display() {
        let err = CeError::UserBufferFault { vaddr: 0x1000, len: 16 };
        assert_eq!(err.to_string(), "Bad user buffer at 0x1000 (16 bytes)");
        let err = CeError::HardwareAnomaly(HwAnomaly::KeyTimerExpired);
        assert_eq!(err.to_string(), "Hardware anomaly after timeout: key timer expired");
    }
}
