//! Error types for promsketch

use std::fmt;

/// Result type alias for promsketch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for promsketch
#[derive(Debug)]
pub enum Error {
    /// Malformed request or expression
    Validation(String),
    /// Function name not recognised
    UnknownFunction(String),
    /// Numeric argument outside the function's accepted range
    ArgumentOutOfRange {
        function: String,
        value: f64,
        expected: &'static str,
    },
    /// A partition would be assigned a reserved address
    ReservedAddress { port: u16 },
    /// Registration asked for a different partition size than the active plan
    PartitionSizeMismatch { active: u64, requested: u64 },
    /// Required partition count exceeds the configured ceiling
    CapacityExceeded { required: usize, max: usize },
    /// A partition could not be brought up
    Provisioning(String),
    /// Sketch engine failure
    Sketch(String),
    /// A single sample could not be ingested
    InvalidSample(String),
    /// Configuration errors
    Config(String),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Timeout
    Timeout,
    /// Internal error
    Internal(String),
}

impl Error {
    /// Whether the error was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::UnknownFunction(_)
                | Error::ArgumentOutOfRange { .. }
                | Error::ReservedAddress { .. }
                | Error::PartitionSizeMismatch { .. }
                | Error::CapacityExceeded { .. }
                | Error::InvalidSample(_)
                | Error::Serialization(_)
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::UnknownFunction(name) => write!(f, "Unknown function: {}", name),
            Error::ArgumentOutOfRange {
                function,
                value,
                expected,
            } => write!(
                f,
                "Argument {} out of range for {}: expected {}",
                value, function, expected
            ),
            Error::ReservedAddress { port } => {
                write!(f, "Port {} is reserved and cannot host a partition", port)
            }
            Error::PartitionSizeMismatch { active, requested } => write!(
                f,
                "Partition size mismatch: active plan uses {} machines per partition, request asked for {}",
                active, requested
            ),
            Error::CapacityExceeded { required, max } => write!(
                f,
                "Capacity exceeded: {} partitions required, at most {} allowed",
                required, max
            ),
            Error::Provisioning(msg) => write!(f, "Provisioning error: {}", msg),
            Error::Sketch(msg) => write!(f, "Sketch error: {}", msg),
            Error::InvalidSample(msg) => write!(f, "Invalid sample: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Internal(format!("metrics registry: {}", e))
    }
}

impl From<tokio::sync::AcquireError> for Error {
    fn from(_: tokio::sync::AcquireError) -> Self {
        Error::Internal("ingest gate closed".to_string())
    }
}
