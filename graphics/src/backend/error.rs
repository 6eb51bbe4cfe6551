//! Backend error types.

/// Errors that can occur in backend operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Failed to create a resource.
    ResourceCreationFailed(String),
    /// Out of GPU memory.
    OutOfMemory,
    /// The device was lost.
    DeviceLost,
    /// A handle does not name a live object of this backend.
    InvalidHandle(String),
    /// Invalid parameter.
    InvalidParameter(String),
    /// Internal backend error.
    Internal(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::InvalidHandle(msg) => write!(f, "invalid handle: {msg}"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::Internal(msg) => write!(f, "internal backend error: {msg}"),
        }
    }
}

impl std::error::Error for BackendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(BackendError::OutOfMemory.to_string(), "out of GPU memory");
        assert_eq!(
            BackendError::InvalidHandle("buffer 7".to_string()).to_string(),
            "invalid handle: buffer 7"
        );
    }
}
