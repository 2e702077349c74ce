//! Bootstrap error types.

use thiserror::Error;

use crate::blob::BlobStoreError;
use crate::meta::MetaStoreError;
use crate::upstream::UpstreamError;

/// Errors that can occur while assembling the core context.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to connect metastore: {0}")]
    MetaStore(#[from] MetaStoreError),

    #[error("failed to set up blobstore: {0}")]
    BlobStore(#[from] BlobStoreError),

    #[error("failed to set up upstream client: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_cause() {
        let err = AppError::Config("missing upstream url".to_string());
        assert!(err.to_string().contains("missing upstream url"));

        let err: AppError = MetaStoreError::Unavailable("refused".to_string()).into();
        assert!(err.to_string().contains("refused"));
    }
}
