//! Engine error types.

use thiserror::Error;
use vderive_catalog::CatalogError;
use vderive_models::FrameIndexError;
use vderive_queue::QueueError;
use vderive_storage::StorageError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing data from video: {0}")]
    MissingMetadata(String),

    #[error("Unrecognized timestamp format: {0}")]
    MalformedTimestamp(String),

    #[error("Invalid request: {0}")]
    InvalidRequestShape(String),

    #[error("Transcoding requires a format")]
    FormatRequired,

    #[error("Invalid completion: {0}")]
    InvalidCompletion(String),

    #[error("Catalog error: {0}")]
    Catalog(CatalogError),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn missing_metadata(field: impl Into<String>) -> Self {
        Self::MissingMetadata(field.into())
    }

    pub fn invalid_completion(msg: impl Into<String>) -> Self {
        Self::InvalidCompletion(msg.into())
    }

    /// Check whether the error was caused by the caller's request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyExists(_)
                | EngineError::NotFound(_)
                | EngineError::MissingMetadata(_)
                | EngineError::MalformedTimestamp(_)
                | EngineError::InvalidRequestShape(_)
                | EngineError::FormatRequired
        )
    }
}

impl From<CatalogError> for EngineError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::AlreadyExists(msg) => EngineError::AlreadyExists(msg),
            CatalogError::NotFound(msg) => EngineError::NotFound(msg),
            CatalogError::InvalidFormat(e) => EngineError::InvalidRequestShape(e.to_string()),
            other => EngineError::Catalog(other),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            EngineError::NotFound(err.to_string())
        } else {
            EngineError::Storage(err)
        }
    }
}

impl From<FrameIndexError> for EngineError {
    fn from(err: FrameIndexError) -> Self {
        match err {
            err @ FrameIndexError::InvalidRequestShape => {
                EngineError::InvalidRequestShape(err.to_string())
            }
            FrameIndexError::MissingMetadata(field) => EngineError::MissingMetadata(field.to_string()),
            FrameIndexError::MalformedTimestamp(raw) => EngineError::MalformedTimestamp(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vderive_models::FormatError;

    #[test]
    fn test_catalog_errors_map_to_taxonomy() {
        let err: EngineError = CatalogError::already_exists("format 'x'").into();
        assert!(matches!(err, EngineError::AlreadyExists(_)));

        let err: EngineError = CatalogError::InvalidFormat(FormatError::EmptyName).into();
        assert!(matches!(err, EngineError::InvalidRequestShape(_)));
        assert!(err.is_client_error());

        let err: EngineError = CatalogError::FrameIndex(u64::MAX).into();
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_frame_index_errors_map_to_taxonomy() {
        let err: EngineError = FrameIndexError::MissingMetadata("duration").into();
        assert_eq!(err.to_string(), "Missing data from video: duration");

        let err: EngineError = FrameIndexError::MalformedTimestamp("a:b".into()).into();
        assert!(matches!(err, EngineError::MalformedTimestamp(ref raw) if raw == "a:b"));
    }

    #[test]
    fn test_missing_stored_file_is_not_found() {
        let err: EngineError = StorageError::not_found("abc").into();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
