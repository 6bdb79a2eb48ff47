//! Error types for process creation, control and piped I/O

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::pipe::StreamKind;

/// Process management errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Invalid configuration (missing executable, NUL bytes, malformed env keys)
    #[error("Invalid process configuration: {0}")]
    InvalidConfig(String),

    /// A native call failed; carries the OS error code
    #[error("{operation} failed: {errno}")]
    Platform {
        /// Name of the native operation that failed
        operation: &'static str,
        /// Native error code
        errno: Errno,
    },

    /// Operation on an instance that was already disposed
    #[error("This {0} has already been disposed")]
    Disposed(&'static str),

    /// Access to a standard stream that was not redirected
    #[error("The {0} stream was not redirected")]
    NotRedirected(StreamKind),

    /// Called outside of a tokio runtime
    #[error("No tokio runtime is available to drive background I/O")]
    NoRuntime,

    /// Process did not exit within the configured timeout
    #[error("Process timed out after {millis}ms")]
    Timeout {
        /// Timeout that elapsed
        millis: u128,
    },

    /// Reading or writing a line on a live pipe failed
    #[error("I/O error on {stream} stream: {source}")]
    Io {
        /// Stream the failure happened on
        stream: StreamKind,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// A subscriber panicked while an event was dispatched
    #[error("Subscriber panicked while handling {event}: {message}")]
    SubscriberFault {
        /// Event being dispatched
        event: &'static str,
        /// Panic payload, when it was a string
        message: String,
    },
}

impl ProcessError {
    pub(crate) fn platform(operation: &'static str, errno: Errno) -> Self {
        Self::Platform { operation, errno }
    }

    /// Maps an `io::Error` coming from a native call onto [`ProcessError::Platform`]
    pub(crate) fn from_io(operation: &'static str, err: &io::Error) -> Self {
        let errno = err.raw_os_error().map_or(Errno::EIO, Errno::from_raw);
        Self::platform(operation, errno)
    }

    /// Native error code, if this is a platform failure
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Platform { errno, .. } => Some(*errno as i32),
            Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Whether this error reports misuse of a disposed instance or an
    /// unredirected stream
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Self::Disposed(_) | Self::NotRedirected(_) | Self::NoRuntime
        )
    }

    /// Whether this error reports a failed native call
    pub fn is_platform(&self) -> bool {
        matches!(self, Self::Platform { .. })
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_carries_native_code() {
        let err = ProcessError::platform("terminate process", Errno::ESRCH);
        assert!(err.is_platform());
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
        assert!(err.to_string().starts_with("terminate process failed"));
    }

    #[test]
    fn test_from_io_keeps_os_code() {
        let io_err = io::Error::from_raw_os_error(libc::EBADF);
        let err = ProcessError::from_io("duplicate handle", &io_err);
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_invalid_state_classification() {
        assert!(ProcessError::Disposed("process").is_invalid_state());
        assert!(ProcessError::NotRedirected(StreamKind::Error).is_invalid_state());
        assert!(!ProcessError::InvalidConfig("x".into()).is_invalid_state());
        assert_eq!(
            ProcessError::NotRedirected(StreamKind::Output).to_string(),
            "The output stream was not redirected"
        );
    }
}
