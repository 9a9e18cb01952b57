use std::time::Duration;

use reqwest::redirect;

use crate::config::Config;

/// The `User-Agent` sent with every request to an origin.
pub const USER_AGENT: &str = concat!("depot/", env!("CARGO_PKG_VERSION"));

/// The maximum number of redirects followed for one request.
const MAX_REDIRECTS: usize = 5;

/// Various timeouts for requests to origins.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the response headers.
    pub head: Duration,
    /// Global timeout for one download, including the body.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            head: Duration::from_secs(10),
            max_download: Duration::from_secs(60),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and download timeouts.
/// * `accept_invalid_certs` determines whether the client accepts invalid
///   SSL certificates.
pub fn create_client(
    timeouts: &DownloadTimeouts,
    accept_invalid_certs: bool,
) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .danger_accept_invalid_certs(accept_invalid_certs)
        .redirect(redirect::Policy::limited(MAX_REDIRECTS))
        .build()
}
