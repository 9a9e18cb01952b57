//! Service to download files from remote origins.
//!
//! Downloads are streamed into a destination file. Whether a downloaded file is kept is decided
//! by the caller, which writes into a temporary file and only persists it on success.

use std::error::Error;
use std::time::{Instant, SystemTime};

use futures::prelude::*;
use reqwest::{Response, StatusCode, header};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::config::Config;
use crate::utils::http::{DownloadTimeouts, create_client};

impl CacheError {
    fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

/// Maps a non-successful status code of an origin to an error.
fn status_error(url: &Url, status: StatusCode) -> CacheError {
    debug_assert!(!status.is_success());

    if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        tracing::debug!("Origin does not have `{url}`: {status}");
        CacheError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");
        CacheError::UpstreamStatus(status.as_u16())
    }
}

/// Emits the duration of a request to an origin when dropped.
///
/// Requests that never completed are tagged as `canceled`.
struct MeasureDownloadGuard {
    task_name: &'static str,
    status: &'static str,
    creation_time: Instant,
    bytes_transferred: u64,
}

impl MeasureDownloadGuard {
    fn new(task_name: &'static str) -> Self {
        Self {
            task_name,
            status: "canceled",
            creation_time: Instant::now(),
            bytes_transferred: 0,
        }
    }

    fn done<T>(&mut self, result: &CacheContents<T>) {
        self.status = match result {
            Ok(_) => "ok",
            Err(err) => err.metrics_tag(),
        };
    }
}

impl Drop for MeasureDownloadGuard {
    fn drop(&mut self) {
        let duration = self.creation_time.elapsed();
        metric!(
            timer("download_duration") = duration,
            "task_name" => self.task_name,
            "status" => self.status,
        );
        if self.bytes_transferred > 0 {
            metric!(
                histogram("download_size") = self.bytes_transferred,
                "task_name" => self.task_name,
            );
        }
    }
}

/// A service which can download files from remote origins.
#[derive(Debug)]
pub struct DownloadService {
    client: reqwest::Client,
    timeouts: DownloadTimeouts,
}

impl DownloadService {
    /// Creates a downloader with the timeouts and TLS settings of `config`.
    pub fn new(config: &Config) -> reqwest::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        Self::with_timeouts(timeouts, config.accept_invalid_certs)
    }

    pub fn with_timeouts(
        timeouts: DownloadTimeouts,
        accept_invalid_certs: bool,
    ) -> reqwest::Result<Self> {
        let client = create_client(&timeouts, accept_invalid_certs)?;
        Ok(Self { client, timeouts })
    }

    pub fn timeouts(&self) -> &DownloadTimeouts {
        &self.timeouts
    }

    /// Sends a request, giving the origin `head` time to respond with its headers.
    async fn send(&self, request: reqwest::RequestBuilder) -> CacheContents<Response> {
        let head = self.timeouts.head;
        tokio::time::timeout(head, request.send())
            .await
            .map_err(|_| CacheError::Timeout(head))?
            .map_err(CacheError::from)
    }

    /// Asks the origin for the modification time of `url` with a `HEAD` request.
    ///
    /// Returns `None` if the origin does not support `HEAD` requests or does not send a
    /// parseable `Last-Modified` header.
    pub async fn last_modified(&self, url: &Url) -> CacheContents<Option<SystemTime>> {
        tracing::debug!("Checking modification time of `{url}`");

        let mut measure = MeasureDownloadGuard::new("head");
        let result = self.head(url).await;
        measure.done(&result);
        result
    }

    async fn head(&self, url: &Url) -> CacheContents<Option<SystemTime>> {
        let response = self.send(self.client.head(url.clone())).await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(url, status));
        }

        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| chrono::DateTime::parse_from_rfc2822(value).ok())
            .map(SystemTime::from);

        if last_modified.is_none() {
            tracing::trace!("No usable `Last-Modified` for `{url}`");
        }
        Ok(last_modified)
    }

    /// Downloads `url` into `destination`.
    ///
    /// The whole download, including the response body, is bounded by the `max_download`
    /// timeout. On error, `destination` may contain a partial download.
    pub async fn download(&self, url: &Url, destination: &mut tokio::fs::File) -> CacheContents {
        tracing::debug!("Fetching `{url}`");

        let max_download = self.timeouts.max_download;
        let mut measure = MeasureDownloadGuard::new("get");
        let result = tokio::time::timeout(
            max_download,
            self.download_body(url, destination, &mut measure.bytes_transferred),
        )
        .await
        .unwrap_or(Err(CacheError::Timeout(max_download)));
        measure.done(&result);

        if let Err(err) = &result {
            tracing::debug!(error = %err, "Failed to download `{url}`");
        }
        result
    }

    async fn download_body(
        &self,
        url: &Url,
        destination: &mut tokio::fs::File,
        bytes_transferred: &mut u64,
    ) -> CacheContents {
        let response = self.send(self.client.get(url.clone())).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status));
        }
        tracing::trace!("Success hitting `{url}`");

        let mut stream = response.bytes_stream().map_err(CacheError::from);
        while let Some(chunk) = stream.next().await.transpose()? {
            *bytes_transferred += chunk.len() as u64;
            destination.write_all(&chunk).await?;
        }
        destination.flush().await?;

        Ok(())
    }
}
