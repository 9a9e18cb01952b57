//! Service for serving files of remote origins.
//!
//! Fetched files are kept for the remote cache's `ttl`. After that, the origin is asked for the
//! file's `Last-Modified` time, and the file is only downloaded again if the origin has a newer
//! version.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use tempfile::NamedTempFile;
use url::Url;

use crate::caching::{
    Artifact, Cache, CacheContents, CacheError, CacheItemRequest, CacheKey, CachedArtifact,
    Cacher, SourcePath, unix_secs,
};
use crate::download::DownloadService;

/// The interface to the [`Cacher`] service.
///
/// The main work is done by the [`CacheItemRequest`] impl.
#[derive(Debug, Clone)]
pub struct FetchRemoteFile {
    uri: Url,
    key: CacheKey,
    downloader: Arc<DownloadService>,
}

impl FetchRemoteFile {
    pub fn new(uri: Url, downloader: Arc<DownloadService>) -> CacheContents<Self> {
        let key = CacheKey::for_remote(&uri)?;
        Ok(Self {
            uri,
            key,
            downloader,
        })
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }
}

impl CacheItemRequest for FetchRemoteFile {
    fn get_cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    /// Keeps the local file if the origin's version is not newer than it.
    ///
    /// Origins that do not report a modification time, or cannot be asked, cause a download.
    fn revalidate(&self, modified: SystemTime) -> BoxFuture<'_, CacheContents<bool>> {
        Box::pin(async move {
            match self.downloader.last_modified(&self.uri).await {
                Ok(Some(last_modified)) => Ok(unix_secs(last_modified) <= unix_secs(modified)),
                Ok(None) => Ok(false),
                Err(CacheError::NotFound) => Err(CacheError::NotFound),
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to revalidate `{}`", self.uri);
                    Ok(false)
                }
            }
        })
    }

    /// Downloads the file into `temp_file`.
    ///
    /// Only when [`Ok`] is returned is the data written to `temp_file` used.
    fn compute<'a>(&'a self, temp_file: &'a mut NamedTempFile) -> BoxFuture<'a, CacheContents> {
        Box::pin(async move {
            let mut destination = tokio::fs::File::from_std(temp_file.reopen()?);
            self.downloader.download(&self.uri, &mut destination).await
        })
    }
}

/// Serves files of the configured origins from the remote cache.
#[derive(Debug, Clone)]
pub struct RemoteFileService {
    cacher: Arc<Cacher<FetchRemoteFile>>,
    downloader: Arc<DownloadService>,
    origins: Arc<BTreeMap<String, Url>>,
    wait_timeout: Duration,
}

impl RemoteFileService {
    pub fn new(
        cache: Cache,
        downloader: Arc<DownloadService>,
        origins: BTreeMap<String, Url>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            cacher: Arc::new(Cacher::new(cache)),
            downloader,
            origins: Arc::new(origins),
            wait_timeout,
        }
    }

    pub fn cache(&self) -> &Cache {
        self.cacher.config()
    }

    /// Resolves `path` below the base URL of the origin named `origin`.
    ///
    /// Unknown origins are [`NotFound`](CacheError::NotFound), paths that would leave the base
    /// URL are an [`InvalidKey`](CacheError::InvalidKey).
    pub fn origin_url(&self, origin: &str, path: &str, query: Option<&str>) -> CacheContents<Url> {
        let base = self.origins.get(origin).ok_or(CacheError::NotFound)?;
        let path = SourcePath::parse(path)?;

        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| CacheError::InvalidKey)?
            .pop_if_empty()
            .extend(path.as_str().split('/'));
        url.set_query(query.filter(|q| !q.is_empty()));

        Ok(url)
    }

    fn request(&self, uri: Url) -> CacheContents<FetchRemoteFile> {
        FetchRemoteFile::new(uri, Arc::clone(&self.downloader))
    }

    /// Makes sure a fresh copy of `uri` is cached.
    pub async fn ensure(&self, uri: Url) -> CacheContents<CachedArtifact> {
        let request = self.request(uri)?;
        self.cacher.ensure(request, self.wait_timeout).await
    }

    /// Makes sure a fresh copy of `uri` is cached and opens it.
    pub async fn serve(&self, uri: Url) -> CacheContents<Artifact> {
        let request = self.request(uri)?;
        self.cacher.serve(request, self.wait_timeout).await
    }
}
