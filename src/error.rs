//! Error types for the preview cache proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error types that can occur while proxying or populating the cache
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Origin unreachable: {0}")]
    OriginUnreachable(String),

    #[error("Origin server rejected request: {status} - {message}")]
    OriginRejected { status: u16, message: String },

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Unable to determine resource size: {0}")]
    SizeUnknown(String),

    #[error("Origin body incomplete: expected {expected} bytes, received {received}")]
    IncompleteBody { expected: u64, received: u64 },

    #[error("Cache file truncated: expected {expected} bytes, found {actual}")]
    TruncatedCache { expected: u64, actual: u64 },

    #[error("Range start {start} not satisfiable for {size} byte resource")]
    RangeNotSatisfiable { start: u64, size: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Metadata resolver error: {0}")]
    ResolverError(String),

    #[error("No metadata resolver configured")]
    ResolverUnavailable,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            ProxyError::origin_rejected(status.as_u16(), err.to_string())
        } else {
            ProxyError::OriginUnreachable(err.to_string())
        }
    }
}

impl ProxyError {
    /// Convert error to HTTP status code
    ///
    /// Origin failures surface as 502 (504 on timeout), a truncated cache file
    /// and other local failures as 500.
    pub fn to_http_status(&self) -> u16 {
        match self {
            ProxyError::OriginUnreachable(_) => 502,
            ProxyError::OriginRejected { .. } => 502,
            ProxyError::Timeout(_) => 504,
            ProxyError::SizeUnknown(_) => 502,
            ProxyError::IncompleteBody { .. } => 502,

            ProxyError::RangeNotSatisfiable { .. } => 416,
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::ResolverError(_) => 400,
            ProxyError::ResolverUnavailable => 501,
            ProxyError::Cancelled => 503,

            ProxyError::TruncatedCache { .. } => 500,
            ProxyError::ConfigError(_) => 500,
            ProxyError::IoError(_) => 500,
            ProxyError::InternalError(_) => 500,
        }
    }

    /// Whether the failure originated at the origin server rather than locally
    pub fn is_origin_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::OriginUnreachable(_)
                | ProxyError::OriginRejected { .. }
                | ProxyError::Timeout(_)
                | ProxyError::SizeUnknown(_)
                | ProxyError::IncompleteBody { .. }
        )
    }

    /// Create an OriginRejected error from a status code and message
    pub fn origin_rejected(status: u16, message: impl Into<String>) -> Self {
        ProxyError::OriginRejected {
            status,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_errors_map_to_bad_gateway() {
        assert_eq!(ProxyError::OriginUnreachable("refused".into()).to_http_status(), 502);
        assert_eq!(ProxyError::origin_rejected(404, "gone").to_http_status(), 502);
        assert_eq!(ProxyError::origin_rejected(503, "busy").to_http_status(), 502);
        assert_eq!(ProxyError::Timeout("slow".into()).to_http_status(), 504);
    }

    #[test]
    fn test_truncated_cache_is_server_error() {
        let err = ProxyError::TruncatedCache {
            expected: 1000,
            actual: 10,
        };
        assert_eq!(err.to_http_status(), 500);
        assert!(!err.is_origin_failure());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ProxyError = io.into();
        assert!(matches!(err, ProxyError::IoError(ref msg) if msg.contains("missing")));
    }

    #[test]
    fn test_client_facing_statuses() {
        assert_eq!(ProxyError::InvalidRequest("no url".into()).to_http_status(), 400);
        assert_eq!(
            ProxyError::RangeNotSatisfiable { start: 10, size: 5 }.to_http_status(),
            416
        );
        assert_eq!(ProxyError::ResolverUnavailable.to_http_status(), 501);
    }
}
