use std::path::Path;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use depot_service::metric;
use depot_service::services::SharedServices;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::{ServiceBuilder, ServiceExt};
use tower_http::services::ServeFile;

mod error;
mod images;
mod remote;

pub use error::ResponseError;

use images::serve_image;
use remote::serve_remote_file;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

/// Records the duration and status code of every request.
async fn track_requests(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;

    metric!(timer("requests.duration") = start.elapsed());
    metric!(
        counter("responses.status_code") += 1,
        "status" => response.status().as_str(),
    );
    response
}

/// Answers `request` with the file at `path`.
///
/// This takes care of byte ranges and conditional requests, using the file's modification time
/// as `Last-Modified`.
async fn serve_file(path: &Path, request: Request<Body>) -> Response {
    let response = ServeFile::new(path).oneshot(request).await;
    match response {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

pub fn create_app(services: SharedServices) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(middleware::from_fn(track_requests));
    Router::new()
        .route("/remote/:origin/*path", get(serve_remote_file))
        .route("/images/*path", get(serve_image))
        .with_state(services)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
