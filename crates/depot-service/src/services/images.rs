//! Service for serving resized variants of local images.
//!
//! Every variant is derived from a source file below the configured `source_dir` by the
//! [`TransformService`], for one of the allowed `max_sides`. A variant stays valid as long as its
//! source file is not modified after it.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use tempfile::NamedTempFile;

use crate::caching::{
    Artifact, Cache, CacheContents, CacheError, CacheItemRequest, CacheKey, CachedArtifact,
    Cacher, Freshness, SourcePath, unix_secs,
};
use crate::config::ImagesConfig;
use crate::transform::TransformService;

/// The interface to the [`Cacher`] service.
#[derive(Debug, Clone)]
pub struct DeriveImage {
    source: SourcePath,
    source_path: PathBuf,
    max_side: u32,
    temp_suffix: String,
    key: CacheKey,
    transform: Arc<TransformService>,
}

impl DeriveImage {
    /// Returns the modification time of the source file.
    fn source_modified(&self) -> CacheContents<SystemTime> {
        match self.source_path.metadata() {
            Ok(metadata) if metadata.is_file() => Ok(metadata.modified()?),
            Ok(_) => Err(CacheError::NotFound),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CacheError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

impl CacheItemRequest for DeriveImage {
    fn get_cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    fn temp_suffix(&self) -> &str {
        &self.temp_suffix
    }

    /// A variant is fresh unless its source was modified after it.
    ///
    /// The `ttl` only bounds how long this verdict is remembered.
    fn check_freshness(&self, modified: SystemTime, _ttl: Duration) -> CacheContents<Freshness> {
        let source_modified = self.source_modified()?;
        if unix_secs(source_modified) > unix_secs(modified) {
            tracing::trace!("Source `{}` changed after its variant", self.source);
            return Ok(Freshness::Stale);
        }
        Ok(Freshness::Fresh {
            confirmed: SystemTime::now(),
        })
    }

    fn compute<'a>(&'a self, temp_file: &'a mut NamedTempFile) -> BoxFuture<'a, CacheContents> {
        Box::pin(async move {
            self.source_modified()?;
            let result = self
                .transform
                .transform(&self.source_path, temp_file.path(), self.max_side)
                .await;
            if result.is_err() {
                // the source may have been removed while the program was running
                self.source_modified()?;
            }
            result
        })
    }
}

/// Serves resized variants of the images in `source_dir` from the derived cache.
#[derive(Debug, Clone)]
pub struct ImageService {
    cacher: Arc<Cacher<DeriveImage>>,
    transform: Arc<TransformService>,
    source_dir: Option<PathBuf>,
    max_sides: Arc<[u32]>,
    extension: Arc<str>,
    wait_timeout: Duration,
}

impl ImageService {
    pub fn new(cache: Cache, config: &ImagesConfig, wait_timeout: Duration) -> Self {
        Self {
            cacher: Arc::new(Cacher::new(cache)),
            transform: Arc::new(TransformService::new(config)),
            source_dir: config.source_dir.clone(),
            max_sides: config.max_sides.as_slice().into(),
            extension: config.extension.as_str().into(),
            wait_timeout,
        }
    }

    pub fn cache(&self) -> &Cache {
        self.cacher.config()
    }

    /// The file extension of all variants.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Creates the request for the variant of `source` that fits into `max_side`.
    ///
    /// Sizes that are not allowed are rejected before the source is looked at.
    pub fn request(&self, source: &str, max_side: u32) -> CacheContents<DeriveImage> {
        if !self.max_sides.contains(&max_side) {
            tracing::debug!("Rejecting max side {max_side}");
            return Err(CacheError::InvalidKey);
        }
        let source = SourcePath::parse(source)?;
        let source_dir = self.source_dir.as_deref().ok_or(CacheError::NotFound)?;

        Ok(DeriveImage {
            source_path: source.resolve(source_dir),
            key: CacheKey::for_derived(&source, max_side, &self.extension),
            temp_suffix: format!(".{}", self.extension),
            source,
            max_side,
            transform: Arc::clone(&self.transform),
        })
    }

    /// Makes sure a current variant of `source` for `max_side` is cached.
    pub async fn ensure(&self, source: &str, max_side: u32) -> CacheContents<CachedArtifact> {
        let request = self.request(source, max_side)?;
        self.cacher.ensure(request, self.wait_timeout).await
    }

    /// Makes sure a current variant of `source` for `max_side` is cached and opens it.
    pub async fn serve(&self, source: &str, max_side: u32) -> CacheContents<Artifact> {
        let request = self.request(source, max_side)?;
        self.cacher.serve(request, self.wait_timeout).await
    }

    /// Removes all cached variants of `source`, so the next request derives them anew.
    pub fn invalidate(&self, source: &str) -> CacheContents {
        let source = SourcePath::parse(source)?;
        let variants = self.variants_dir(&source);

        tracing::debug!("Invalidating variants of `{source}`");
        match std::fs::remove_dir_all(&variants) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Deletes the source file of `source` along with all of its cached variants.
    ///
    /// A source that does not exist is not an error, its variants are removed regardless.
    pub fn remove(&self, source: &str) -> CacheContents {
        let parsed = SourcePath::parse(source)?;
        let source_dir = self.source_dir.as_deref().ok_or(CacheError::NotFound)?;

        tracing::debug!("Removing source `{parsed}`");
        match std::fs::remove_file(parsed.resolve(source_dir)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.invalidate(source)
    }

    /// Returns the directory variants of `source` are stored in.
    fn variants_dir(&self, source: &SourcePath) -> PathBuf {
        source.resolve(self.cache().cache_dir())
    }
}
