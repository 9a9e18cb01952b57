use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::response::Response;
use depot_service::services::SharedServices;

use super::{ResponseError, serve_file};

/// Serves a file of one of the configured origins, fetching it if there is no fresh copy.
pub async fn serve_remote_file(
    State(services): State<SharedServices>,
    Path((origin, path)): Path<(String, String)>,
    request: Request<Body>,
) -> Result<Response, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /remote"));
    });

    let remote = &services.remote;
    let path = path.trim_start_matches('/');
    let uri = remote.origin_url(&origin, path, request.uri().query())?;

    tracing::debug!("Serving `{uri}`");
    let artifact = remote.ensure(uri).await?;

    Ok(serve_file(&artifact.path, request).await)
}
