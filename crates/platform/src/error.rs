//! Error types for kernel data-plane operations

use std::fmt;

/// Unified error type for kernel data-plane operations
#[derive(Debug)]
pub enum PlatformError {
    /// I/O error talking to the kernel
    Io(std::io::Error),

    /// The kernel rejected the SA specification
    InvalidSpec(String),

    /// No resource available (SPI/CPI space exhausted, table full)
    ResourceExhausted(String),

    /// The referenced SA does not exist
    NotFound(String),

    /// Operation not supported on this platform
    NotSupported(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Io(e) => write!(f, "IO error: {}", e),
            PlatformError::InvalidSpec(msg) => write!(f, "Invalid SA specification: {}", msg),
            PlatformError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            PlatformError::NotFound(msg) => write!(f, "SA not found: {}", msg),
            PlatformError::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            PlatformError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlatformError::Io(e) => Some(e),
            PlatformError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::Io(err)
    }
}

/// Result type for kernel data-plane operations
pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlatformError::InvalidSpec("zero SPI".to_string());
        assert_eq!(err.to_string(), "Invalid SA specification: zero SPI");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "netlink denied");
        let err: PlatformError = io_err.into();
        assert!(matches!(err, PlatformError::Io(_)));
    }

    #[test]
    fn test_result_type() {
        fn example() -> PlatformResult<u16> {
            Ok(0x4000)
        }

        assert_eq!(example().unwrap(), 0x4000);
    }
}
