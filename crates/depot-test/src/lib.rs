//! Helpers for testing the web server and services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, this might silently leak the temp
//!    directory, since depot will create it again lazily after it has been deleted. To avoid
//!    this, assign it to a variable in the test function (e.g. `let _cache_dir = tempdir()`).
//!
//!  - When using an [`Origin`], make sure that it is held until all requests to it have been
//!    made. It stops serving when dropped.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the depot crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("depot=trace,depot_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Starts serving `router` on an ephemeral port of `127.0.0.1`.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct OriginState {
    files: BTreeMap<String, Vec<u8>>,
    last_modified: Option<SystemTime>,
    failing: bool,
    delay: Duration,
    gets: BTreeMap<String, usize>,
    heads: BTreeMap<String, usize>,
}

type SharedOriginState = Arc<Mutex<OriginState>>;

/// Formats `time` as an HTTP date, like `Tue, 15 Nov 1994 08:12:31 GMT`.
fn http_date(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

async fn serve_origin(
    State(state): State<SharedOriginState>,
    method: Method,
    uri: Uri,
) -> Response {
    let delay = {
        let mut state = state.lock().unwrap();
        let path = uri.path().to_owned();
        if method == Method::HEAD {
            *state.heads.entry(path).or_default() += 1;
        } else {
            *state.gets.entry(path).or_default() += 1;
        }
        state.delay
    };

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let state = state.lock().unwrap();
    if state.failing {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let Some(contents) = state.files.get(uri.path().trim_start_matches('/')) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut headers = HeaderMap::new();
    if let Some(last_modified) = state.last_modified {
        let value = HeaderValue::from_str(&http_date(last_modified)).unwrap();
        headers.insert(header::LAST_MODIFIED, value);
    }

    if method == Method::HEAD {
        return headers.into_response();
    }
    (headers, contents.clone()).into_response()
}

/// An HTTP origin serving files from memory, which counts the requests it receives.
///
/// Requests for files that were not [`put`](Self::put) are answered with `404`.
#[derive(Debug)]
pub struct Origin {
    server: Server,
    state: SharedOriginState,
}

impl Origin {
    pub fn new() -> Self {
        let state = SharedOriginState::default();
        let router = Router::new()
            .fallback(serve_origin)
            .with_state(Arc::clone(&state));
        let server = Server::with_router(router);

        Self { server, state }
    }

    /// Serves `contents` at `path`.
    pub fn put(&self, path: &str, contents: impl Into<Vec<u8>>) {
        let path = path.trim_start_matches('/').to_owned();
        self.state.lock().unwrap().files.insert(path, contents.into());
    }

    /// Stops serving `path`, which is answered with `404` from now on.
    pub fn remove(&self, path: &str) {
        let path = path.trim_start_matches('/');
        self.state.lock().unwrap().files.remove(path);
    }

    /// Sends the given `Last-Modified` header with every file, or none at all.
    pub fn set_last_modified(&self, last_modified: Option<SystemTime>) {
        self.state.lock().unwrap().last_modified = last_modified;
    }

    /// Makes the origin respond with `503` to every request.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// The number of `GET` requests for `path`, which starts with a `/`.
    pub fn gets(&self, path: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.gets.get(path).copied().unwrap_or_default()
    }

    /// The number of `HEAD` requests for `path`, which starts with a `/`.
    pub fn heads(&self, path: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.heads.get(path).copied().unwrap_or_default()
    }

    /// The URL of the origin's root, ending in a `/`.
    pub fn base_url(&self) -> Url {
        self.server.url("/")
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new()
    }
}
