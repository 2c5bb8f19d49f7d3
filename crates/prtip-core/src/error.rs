//! Error types for the scanning engine core library

use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Result type alias for scanner-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Construction-time and setup failures.
///
/// Per-target outcomes use [`crate::types::ProbeError`] instead; spec
/// draws a hard line between "scan could not start" and "this one probe
/// did not resolve".
#[derive(Error, Debug)]
pub enum Error {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),

    /// I/O errors with automatic conversion
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Parsing errors for IP addresses, CIDR, headers
    #[error("Parse error: {0}")]
    Parse(String),

    /// Permission/capability errors, fatal at construction
    #[error("Insufficient privileges: {0}")]
    Privilege(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid target specification
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Invalid CIDR notation
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    /// No suitable network interface found
    #[error("No suitable interface found")]
    NoInterface,

    /// Interface has no IPv4 address assigned
    #[error("Interface has no IPv4 address")]
    InterfaceNoIpv4,

    /// A scan is already running on this engine instance
    #[error("Scan already running")]
    ScanAlreadyRunning,

    /// Generic timeout, used for construction-time waits only
    #[error("Operation timed out")]
    Timeout,

    /// Construction-time or engine-wide cancellation, distinct from a
    /// per-target `ProbeError::Cancelled`.
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::Parse(format!("Invalid IP address: {}", err))
    }
}

impl From<ipnetwork::IpNetworkError> for Error {
    fn from(err: ipnetwork::IpNetworkError) -> Self {
        Error::Parse(format!("Invalid IP network: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = Error::Network("connection refused".to_string());
        assert_eq!(err.to_string(), "Network error: connection refused");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_parse_error_conversion() {
        let parse_err = "invalid".parse::<std::net::IpAddr>().unwrap_err();
        let err: Error = parse_err.into();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().contains("Invalid IP address"));
    }

    #[test]
    fn test_cidr_error_conversion() {
        use ipnetwork::IpNetwork;
        let network_err = "999.0.0.0/24".parse::<IpNetwork>().unwrap_err();
        let err: Error = network_err.into();
        assert!(matches!(err, Error::Parse(_)));
        assert!(err.to_string().contains("Invalid IP network"));
    }

    #[test]
    fn test_scan_already_running_display() {
        let err = Error::ScanAlreadyRunning;
        assert_eq!(err.to_string(), "Scan already running");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Err(Error::Timeout)
        }
        assert!(matches!(returns_result(), Err(Error::Timeout)));
    }
}
