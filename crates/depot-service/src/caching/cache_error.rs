use std::time::Duration;

use thiserror::Error;

/// An error that happens while looking up or populating a cache entry.
///
/// The error is cloneable so that the outcome of a single population can be handed out to
/// every caller that waited on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The requested key is malformed, would escape the cache root, or uses a transform
    /// parameter that is not allowed.
    ///
    /// This is rejected before any file system or network access happens.
    #[error("invalid key")]
    InvalidKey,
    /// The source of the artifact does not exist.
    ///
    /// For remote files this is a `404` or `410` response from the origin, for derived files
    /// the source file is missing on disk.
    #[error("not found")]
    NotFound,
    /// The origin could not be reached, like connection loss, DNS resolution or TLS errors,
    /// or the response body could not be read to the end.
    ///
    /// The attached string contains the innermost error message.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The origin responded with an unexpected status code.
    #[error("origin responded with status {0}")]
    UpstreamStatus(u16),
    /// An operation did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The external transform process could not be started or exited unsuccessfully.
    ///
    /// The details are meant for logs, not for clients.
    #[error("transform failed: {0}")]
    TransformFailed(String),
    /// An unexpected error in depot itself, most often a failing disk operation.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Logs the given error and collapses it into an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Whether this error means the artifact does not exist for the client.
    ///
    /// Such errors are not failures of the cache itself and are served as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::InvalidKey | Self::NotFound)
    }

    /// A short, stable name of the error kind, used as a metrics tag.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalidkey",
            Self::NotFound => "notfound",
            Self::DownloadError(_) => "downloaderror",
            Self::UpstreamStatus(_) => "upstreamstatus",
            Self::Timeout(_) => "timeout",
            Self::TransformFailed(_) => "transformfailed",
            Self::InternalError => "internalerror",
        }
    }
}

/// The result of a cache operation, either `Ok(T)` or an error denoting the reason why the
/// artifact could not be provided.
pub type CacheContents<T = ()> = Result<T, CacheError>;
