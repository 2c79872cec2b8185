//! Error types for the CacheFS operator engine

use thiserror::Error;

/// Main error type for CacheFS reconciliation operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for runtime/dataset specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Failed to parse a quantity, command or metric payload
    #[error("parse error: {0}")]
    Parse(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Exec-in-pod failure
    #[error("pod exec error: {0}")]
    PodExec(String),

    /// Release install/uninstall failure
    #[error("helm error: {0}")]
    Helm(String),

    /// Asynchronous metadata sync failure
    #[error("metadata sync error: {0}")]
    MetadataSync(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a parse error with the given message
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a pod exec error with the given message
    pub fn pod_exec(msg: impl Into<String>) -> Self {
        Self::PodExec(msg.into())
    }

    /// Create a helm error with the given message
    pub fn helm(msg: impl Into<String>) -> Self {
        Self::Helm(msg.into())
    }

    /// Create a metadata sync error with the given message
    pub fn metadata_sync(msg: impl Into<String>) -> Self {
        Self::MetadataSync(msg.into())
    }

    /// Returns true if this error is an optimistic-concurrency write conflict
    /// (HTTP 409 from the API server)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// Returns true if this error means the requested object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        }))
    }

    #[test]
    fn conflict_detection_only_matches_409() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(404).is_conflict());
        assert!(!Error::validation("nope").is_conflict());
    }

    #[test]
    fn not_found_detection_only_matches_404() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(409).is_not_found());
        assert!(!Error::helm("release missing").is_not_found());
    }

    #[test]
    fn messages_carry_category_prefix() {
        assert!(Error::validation("quota 512Mi is less than 1GiB")
            .to_string()
            .contains("validation error"));
        assert!(Error::metadata_sync("total size probe failed")
            .to_string()
            .contains("metadata sync error"));
    }
}
