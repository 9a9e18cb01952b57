use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use depot_service::caching::CacheError;
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

/// Clients only ever see a generic message, the actual error is kept as its cause.
impl From<CacheError> for ResponseError {
    fn from(err: CacheError) -> Self {
        let (status, msg) = match err {
            CacheError::InvalidKey | CacheError::NotFound => (StatusCode::NOT_FOUND, "not found"),
            CacheError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timed out waiting for the artifact",
            ),
            CacheError::DownloadError(_) | CacheError::UpstreamStatus(_) => {
                (StatusCode::BAD_GATEWAY, "failed to fetch the artifact")
            }
            CacheError::TransformFailed(_) | CacheError::InternalError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to produce the artifact",
            ),
        };

        Self {
            status,
            err: anyhow::Error::new(err).context(msg),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    pub detail: Option<String>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        // the causes may name files or contain program output, so only the outermost is exposed
        ApiErrorResponse {
            detail: Some(err.to_string()),
        }
    }
}
