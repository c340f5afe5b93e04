use thiserror::Error;

/// Unified error type for the Subbox engine
#[derive(Error, Debug)]
pub enum SubboxError {
    // Feed errors
    #[error("No proxy links found in subscription payload")]
    NoLinks,

    #[error("No supported proxy configurations in subscription")]
    NoCandidates,

    #[error("Subscription payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    // Decoding errors
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    // Selection errors
    #[error("Index {index} out of range 1..{len}")]
    SelectionOutOfRange { index: usize, len: usize },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Probe errors
    #[error("Executable not found in PATH: {0}")]
    ExecutableNotFound(String),

    #[error("Local port reservation failed: {0}")]
    PortReservation(String),

    #[error("Backend exited before ready: {0}")]
    BackendExited(String),

    #[error("Backend readiness timeout")]
    ReadinessTimeout,

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Subbox operations
pub type Result<T> = std::result::Result<T, SubboxError>;

impl SubboxError {
    /// Check if this error belongs to the timeout class
    ///
    /// A backend that never started listening is a failure of the backend,
    /// not a network timeout, so `ReadinessTimeout` is not included.
    pub fn is_timeout(&self) -> bool {
        match self {
            SubboxError::Timeout => true,
            SubboxError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Check if this error aborts the whole pipeline rather than one candidate
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SubboxError::NoLinks
                | SubboxError::NoCandidates
                | SubboxError::PortReservation(_)
                | SubboxError::InvalidConfig(_)
        )
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for SubboxError {
    fn from(err: url::ParseError) -> Self {
        SubboxError::InvalidDescriptor(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SubboxError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SubboxError::Timeout
    }
}
