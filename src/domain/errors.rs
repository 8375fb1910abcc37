//! Domain errors. Used by ports and use cases.
//!
//! Adapters map infrastructure errors into these. Every error classifies
//! into a category that decides retry behavior and feeds the final report.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("media download failed: {0}")]
    Download(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Rate-limit signal: caller must sleep `seconds` before retrying the
    /// same operation. Never consumes a retry credit.
    #[error("flood wait: retry after {seconds} seconds")]
    FloodWait { seconds: u64 },

    /// File bytes live on a datacenter this session is not connected to;
    /// the raw read path cannot serve it.
    #[error("file is on datacenter {file_dc}, session is on {session_dc}")]
    CrossDatacenter { file_dc: i32, session_dc: i32 },

    #[error("cancelled")]
    Cancelled,
}

/// Coarse error category, assigned at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Auth,
    Permission,
    Validation,
    Resource,
    System,
    Business,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::Network,
        ErrorCategory::RateLimit,
        ErrorCategory::Auth,
        ErrorCategory::Permission,
        ErrorCategory::Validation,
        ErrorCategory::Resource,
        ErrorCategory::System,
        ErrorCategory::Business,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Resource => "resource",
            ErrorCategory::System => "system",
            ErrorCategory::Business => "business",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl DomainError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DomainError::Gateway(_) | DomainError::Download(_) | DomainError::Publish(_) => {
                ErrorCategory::Network
            }
            DomainError::FloodWait { .. } => ErrorCategory::RateLimit,
            DomainError::Auth(_) => ErrorCategory::Auth,
            DomainError::Permission(_) => ErrorCategory::Permission,
            DomainError::Config(_) | DomainError::Validation(_) | DomainError::Template(_) => {
                ErrorCategory::Validation
            }
            DomainError::Io(_) => ErrorCategory::Resource,
            DomainError::Queue(_) | DomainError::Cancelled => ErrorCategory::System,
            DomainError::CrossDatacenter { .. } => ErrorCategory::Business,
        }
    }

    /// Whether exponential backoff may retry this error. Rate limits are
    /// handled separately (sleep the instructed wait, no credit consumed).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Resource
        )
    }

    /// Rate-limit wait in seconds, when this error carries one.
    pub fn flood_wait_secs(&self) -> Option<u64> {
        match self {
            DomainError::FloodWait { seconds } => Some(*seconds),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

/// Structured record produced for every handled error. Aggregated counters
/// by category feed the final report.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    /// Where the error was handled, e.g. "download msg 1234 (session_a)".
    pub context: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorRecord {
    pub fn new(error: &DomainError, severity: Severity, context: impl Into<String>) -> Self {
        Self {
            category: error.category(),
            severity,
            message: error.to_string(),
            context: context.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flood_wait_classifies_as_rate_limit() {
        let err = DomainError::FloodWait { seconds: 17 };
        assert_eq!(err.category(), ErrorCategory::RateLimit);
        assert_eq!(err.flood_wait_secs(), Some(17));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_auth_and_permission_fail_fast() {
        assert!(!DomainError::Auth("bad".into()).is_retryable());
        assert!(!DomainError::Permission("denied".into()).is_retryable());
        assert!(!DomainError::Validation("bad id".into()).is_retryable());
    }

    #[test]
    fn test_network_and_resource_retryable() {
        assert!(DomainError::Gateway("timeout".into()).is_retryable());
        let io = DomainError::Io(std::io::Error::other("disk"));
        assert!(io.is_retryable());
    }

    #[test]
    fn test_cross_datacenter_is_business() {
        let err = DomainError::CrossDatacenter { file_dc: 4, session_dc: 2 };
        assert_eq!(err.category(), ErrorCategory::Business);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_record_carries_category() {
        let err = DomainError::Download("boom".into());
        let record = ErrorRecord::new(&err, Severity::Error, "download msg 1");
        assert_eq!(record.category, ErrorCategory::Network);
        assert!(record.message.contains("boom"));
    }
}
