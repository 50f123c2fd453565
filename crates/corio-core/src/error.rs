//! Error types for the corio runtime

use core::fmt;

/// Result type for runtime operations
pub type CorioResult<T> = Result<T, CorioError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorioError {
    /// No free stack block in any arena
    ArenaExhausted,

    /// Pointer returned to an arena does not belong to it
    InvalidStackPointer,

    /// Operation requires the reactor's owning thread
    OffReactorThread,

    /// Reactor is already running its loop
    AlreadyLooping,

    /// The coroutine cannot be resumed in its current state
    NotResumable,

    /// Operation timed out
    Timeout,

    /// Raw OS error (errno value)
    Os(i32),
}

impl fmt::Display for CorioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorioError::ArenaExhausted => write!(f, "no free stack block in any arena"),
            CorioError::InvalidStackPointer => write!(f, "pointer does not belong to this arena"),
            CorioError::OffReactorThread => write!(f, "called off the reactor's owning thread"),
            CorioError::AlreadyLooping => write!(f, "reactor loop already running"),
            CorioError::NotResumable => write!(f, "coroutine is not resumable"),
            CorioError::Timeout => write!(f, "operation timed out"),
            CorioError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for CorioError {}

impl CorioError {
    /// Capture the calling thread's current errno value
    pub fn last_os() -> Self {
        CorioError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            CorioError::ArenaExhausted.to_string(),
            "no free stack block in any arena"
        );
        assert_eq!(CorioError::Os(11).to_string(), "os error: errno 11");
    }
}
