use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::response::Response;
use depot_service::caching::CacheError;
use depot_service::services::SharedServices;
use serde::Deserialize;

use super::{ResponseError, serve_file};

#[derive(Debug, Deserialize)]
pub struct ImageParams {
    /// The longest side of the requested variant, in pixels.
    m: Option<String>,
}

/// Serves a resized variant of a local image, deriving it if its source changed.
pub async fn serve_image(
    State(services): State<SharedServices>,
    Path(path): Path<String>,
    Query(params): Query<ImageParams>,
    request: Request<Body>,
) -> Result<Response, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /images"));
    });

    let max_side = params
        .m
        .and_then(|m| m.parse::<u32>().ok())
        .ok_or(CacheError::InvalidKey)?;
    let path = path.trim_start_matches('/');

    let artifact = services.images.ensure(path, max_side).await?;

    Ok(serve_file(&artifact.path, request).await)
}
