/// Failure taxonomy shared by the search client, image fetcher, store and engine.
///
/// The enum is `Clone` because a single sync attempt may have many coalesced
/// callers waiting on it, and every one of them receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Photo search unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("Unexpected photo search response: {0}")]
    RemoteParseError(String),
    #[error("Image download failed: {0}")]
    DownloadFailed(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Store failure: {0}")]
    StoreFailure(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Sync cancelled: {0}")]
    Cancelled(String),
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => SyncError::NotFound("row not found".to_string()),
            other => SyncError::StoreFailure(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::StoreFailure(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlx_errors_map_to_store_taxonomy() {
        assert!(matches!(
            SyncError::from(sqlx::Error::RowNotFound),
            SyncError::NotFound(_)
        ));
        assert!(matches!(
            SyncError::from(sqlx::Error::PoolTimedOut),
            SyncError::StoreFailure(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::RemoteParseError("stat=fail".to_string());
        assert_eq!(
            err.to_string(),
            "Unexpected photo search response: stat=fail"
        );
    }
}
