//! Error Types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid source '{source_ref}': {reason}")]
    InvalidSource { source_ref: String, reason: String },

    #[error("No matching ref for {repo}: tried {}", tried.join(", "))]
    RefNotFound { repo: String, tried: Vec<String> },

    #[error("Checkout failed for {repo}: {reason}")]
    CheckoutFailed { repo: String, reason: String },

    #[error("Build failed: {output}")]
    BuildFailed { output: String },

    #[error("Backend error for {service}: {reason}")]
    BackendError { service: String, reason: String },

    #[error("Service not found: {0}")]
    NotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Service already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid service spec: {reason}")]
    InvalidSpec { reason: String },

    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Timeout: {operation} exceeded {limit_ms}ms limit")]
    Timeout { operation: String, limit_ms: u64 },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    pub fn invalid_source(source_ref: &str, reason: impl Into<String>) -> Self {
        Error::InvalidSource {
            source_ref: source_ref.to_string(),
            reason: reason.into(),
        }
    }

    pub fn checkout_failed(repo: &str, reason: impl Into<String>) -> Self {
        Error::CheckoutFailed {
            repo: repo.to_string(),
            reason: reason.into(),
        }
    }

    pub fn backend(service: &str, reason: impl Into<String>) -> Self {
        Error::BackendError {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::Serialization(_) | Error::Other(_) => 1,
            Error::InvalidSource { .. } => 10,
            Error::RefNotFound { .. } => 11,
            Error::CheckoutFailed { .. } => 12,
            Error::BuildFailed { .. } => 20,
            Error::BackendError { .. } => 30,
            Error::NotFound(_) | Error::BlobNotFound(_) => 40,
            Error::AlreadyExists(_) => 41,
            Error::InvalidSpec { .. } => 42,
            Error::InvalidConfig { .. } => 50,
            Error::Store(_) => 60,
            Error::Timeout { .. } => 70,
            Error::Cancelled(_) => 71,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidSource { .. } => "invalid_source",
            Error::RefNotFound { .. } => "ref_not_found",
            Error::CheckoutFailed { .. } => "checkout_failed",
            Error::BuildFailed { .. } => "build_failed",
            Error::BackendError { .. } => "backend_error",
            Error::NotFound(_) | Error::BlobNotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::InvalidSpec { .. } => "invalid_spec",
            Error::InvalidConfig { .. } => "invalid_config",
            Error::Store(_) => "store_error",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "other",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "error": true,
            "kind": self.kind(),
            "exit_code": self.exit_code(),
            "message": self.to_string(),
        })
        .to_string()
    }

    /// Failures the reconciler records on the service and retries next tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::RefNotFound { .. }
                | Error::CheckoutFailed { .. }
                | Error::BuildFailed { .. }
                | Error::BackendError { .. }
                | Error::Timeout { .. }
                | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_not_found_lists_candidates() {
        let err = Error::RefNotFound {
            repo: "github.com/micro/services".to_string(),
            tried: vec!["latest".to_string(), "master".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "No matching ref for github.com/micro/services: tried latest, master"
        );
        assert_eq!(err.kind(), "ref_not_found");
    }

    #[test]
    fn test_caller_errors_are_not_recoverable() {
        assert!(!Error::invalid_source("x", "too short").is_recoverable());
        assert!(!Error::NotFound("foo:latest".into()).is_recoverable());
        assert!(!Error::BlobNotFound("source://foo:latest".into()).is_recoverable());
        assert!(Error::BuildFailed { output: "boom".into() }.is_recoverable());
        assert!(Error::backend("foo:latest", "exit 1").is_recoverable());
    }

    #[test]
    fn test_to_json_escapes_message() {
        let err = Error::other("said \"no\"");
        let value: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(value["kind"], "other");
        assert_eq!(value["message"], "said \"no\"");
    }
}
