use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tempfile::NamedTempFile;

use crate::utils::defer::defer;

use super::freshness::within_ttl;
use super::fs::persist_tempfile;
use super::{Cache, CacheContents, CacheError, CacheKey, FreshnessRecord};

type ComputationChannel = Shared<oneshot::Receiver<CacheContents<SystemTime>>>;
type ComputationMap = Arc<Mutex<HashMap<CacheKey, ComputationChannel>>>;

/// The verdict on an artifact that exists on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The artifact may be served. `confirmed` is remembered in the [`FreshnessRecord`].
    Fresh { confirmed: SystemTime },
    /// The artifact needs to be revalidated or recomputed.
    Stale,
}

/// An artifact that was fresh at the time it was looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    /// The absolute path of the artifact.
    pub path: PathBuf,
    /// The modification time of the artifact, to be used as its `Last-Modified` time.
    pub modified: SystemTime,
}

/// An opened artifact, ready to be served.
#[derive(Debug)]
pub struct Artifact {
    pub file: std::fs::File,
    pub modified: SystemTime,
    pub len: u64,
}

/// Describes how an artifact is checked for freshness and how it is populated.
pub trait CacheItemRequest: 'static + Send + Sync + Clone {
    /// Returns the key by which this item is cached.
    fn get_cache_key(&self) -> CacheKey;

    /// A suffix for the temporary file passed to [`compute`](Self::compute).
    fn temp_suffix(&self) -> &str {
        ""
    }

    /// Decides whether the artifact on disk, last modified at `modified`, can be served.
    ///
    /// This is called for every access that is not answered by the [`FreshnessRecord`], so it
    /// should not do any network requests. The default trusts artifacts for `ttl` after they
    /// were written.
    fn check_freshness(&self, modified: SystemTime, ttl: Duration) -> CacheContents<Freshness> {
        Ok(if within_ttl(modified, ttl, SystemTime::now()) {
            Freshness::Fresh {
                confirmed: modified,
            }
        } else {
            Freshness::Stale
        })
    }

    /// Asks the source whether a stale artifact, last modified at `modified`, is still current.
    ///
    /// Returning `true` keeps the artifact and marks it as fresh without recomputing it.
    fn revalidate(&self, _modified: SystemTime) -> BoxFuture<'_, CacheContents<bool>> {
        Box::pin(async { Ok(false) })
    }

    /// Invoked to compute the artifact and write it to the given temporary file.
    ///
    /// The temporary file is only moved to its final location if this returns `Ok`.
    fn compute<'a>(&'a self, temp_file: &'a mut NamedTempFile) -> BoxFuture<'a, CacheContents>;
}

/// Manages a file system cache of artifacts.
///
/// Transparently performs freshness checks, population and atomic cache stores via the
/// [`CacheItemRequest`] trait.
///
/// Concurrent populations of the same [`CacheKey`] are deduplicated: only one population runs
/// at any time, and its outcome is handed to every caller that waited on it.
pub struct Cacher<T: CacheItemRequest> {
    config: Cache,

    /// Remembers recent freshness confirmations.
    freshness: FreshnessRecord,

    /// Used for deduplicating populations.
    current_computations: ComputationMap,

    _request: std::marker::PhantomData<fn(T)>,
}

impl<T: CacheItemRequest> std::fmt::Debug for Cacher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let computations = self
            .current_computations
            .try_lock()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("Cacher")
            .field("config", &self.config)
            .field("running computations", &computations)
            .finish()
    }
}

impl<T: CacheItemRequest> Clone for Cacher<T> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Cacher {
            config: self.config.clone(),
            freshness: self.freshness.clone(),
            current_computations: Arc::clone(&self.current_computations),
            _request: std::marker::PhantomData,
        }
    }
}

impl<T: CacheItemRequest> Cacher<T> {
    pub fn new(config: Cache) -> Self {
        let freshness =
            FreshnessRecord::new(config.name(), config.ttl(), config.freshness_capacity);
        Cacher {
            config,
            freshness,
            current_computations: Default::default(),
            _request: std::marker::PhantomData,
        }
    }

    pub fn config(&self) -> &Cache {
        &self.config
    }

    /// Looks up the artifact on disk and decides whether it can be served as is.
    ///
    /// Returns `None` if the artifact does not exist or is stale.
    fn lookup_local_cache(&self, request: &T, path: &Path) -> CacheContents<Option<SystemTime>> {
        let name = self.config.name();
        tracing::trace!("Trying {} cache at path {}", name, path.display());

        let Some(modified) = self.config.modified(path)? else {
            return Ok(None);
        };

        match request.check_freshness(modified, self.config.ttl())? {
            Freshness::Fresh { confirmed } => {
                self.freshness
                    .confirm(&request.get_cache_key(), confirmed, modified);
                Ok(Some(modified))
            }
            Freshness::Stale => {
                tracing::trace!("Stale {} at path {}", name, path.display());
                metric!(counter("caches.file.stale") += 1, "cache" => name.as_ref());
                Ok(None)
            }
        }
    }

    /// Populates the artifact.
    ///
    /// This first repeats the disk lookup, as a population that finished right before this one
    /// was started may have already refreshed the artifact. A stale artifact is then revalidated
    /// against its source, and only computed anew if that fails.
    ///
    /// This method does not take care of ensuring the population only happens once even
    /// for concurrent requests, see [`Cacher::ensure`] for this.
    async fn compute(self, request: T, key: CacheKey) -> CacheContents<SystemTime> {
        let name = self.config.name();
        let cache_path = key.cache_path(self.config.cache_dir());

        sentry::configure_scope(|scope| {
            scope.set_extra(
                &format!("cache.{name}.cache_path"),
                cache_path.to_string_lossy().into(),
            );
        });

        if let Some(modified) = self.config.modified(&cache_path)? {
            if let Freshness::Fresh { confirmed } =
                request.check_freshness(modified, self.config.ttl())?
            {
                self.freshness.confirm(&key, confirmed, modified);
                return Ok(modified);
            }

            if request.revalidate(modified).await? {
                if self.config.touch(&cache_path)? {
                    metric!(counter("caches.revalidated") += 1, "cache" => name.as_ref());
                    let now = SystemTime::now();
                    let modified = self.config.modified(&cache_path)?.unwrap_or(now);
                    self.freshness.confirm(&key, now, modified);
                    return Ok(modified);
                }
                // the artifact vanished in the meantime, so it needs to be recomputed anyway
            }
        }

        metric!(counter("caches.computation") += 1, "cache" => name.as_ref());

        let mut temp_file = self.config.tempfile(request.temp_suffix())?;
        let result = request.compute(&mut temp_file).await;
        metric!(
            counter("caches.file.write") += 1,
            "status" => match &result {
                Ok(_) => "positive",
                Err(err) => err.metrics_tag(),
            },
            "cache" => name.as_ref(),
        );
        // dropping `temp_file` removes it
        result?;

        // external programs may replace the file rather than writing into it
        let file_size = std::fs::metadata(temp_file.path())?.len();
        metric!(time_raw("caches.file.size") = file_size, "cache" => name.as_ref());

        tracing::trace!("Creating {name} at path {:?}", cache_path.display());
        persist_tempfile(temp_file, &cache_path)?;
        let modified = std::fs::metadata(&cache_path)?.modified()?;
        self.freshness.confirm(&key, modified, modified);

        Ok(modified)
    }

    /// Creates a shareable channel that populates an artifact.
    ///
    /// The population runs as its own task, so it completes even if every caller that waits on
    /// it gives up. The entry in `current_computations` is removed before the outcome is sent.
    fn create_channel<F>(&self, key: CacheKey, computation: F) -> ComputationChannel
    where
        F: std::future::Future<Output = CacheContents<SystemTime>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let current_computations = Arc::clone(&self.current_computations);
        let remove_computation_token = defer(move || {
            current_computations.lock().unwrap().remove(&key);
        });

        let channel = async move {
            let result = computation.await;
            // Drop the token first to evict from the map.  This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            drop(remove_computation_token);
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(channel);

        receiver.shared()
    }

    /// Spawns the population as a separate task, or joins the one that is already running.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the
    /// population, even if you don’t explicitly `await` its results.
    fn spawn_computation(
        &self,
        request: T,
        key: CacheKey,
    ) -> BoxFuture<'static, CacheContents<SystemTime>> {
        let name = self.config.name();

        let channel = {
            let mut current_computations = self.current_computations.lock().unwrap();
            if let Some(channel) = current_computations.get(&key) {
                // A concurrent population was deduplicated.
                metric!(counter("caches.channel.hit") += 1, "cache" => name.as_ref());
                channel.clone()
            } else {
                metric!(counter("caches.channel.miss") += 1, "cache" => name.as_ref());

                let computation = self.clone().compute(request, key.clone());
                let channel = self.create_channel(key.clone(), computation);
                let evicted = current_computations.insert(key, channel.clone());
                debug_assert!(evicted.is_none());
                channel
            }
        };

        Box::pin(channel.map(move |result| {
            result.unwrap_or_else(|_cancelled| {
                tracing::error!("{name} computation channel dropped");
                Err(CacheError::InternalError)
            })
        }))
    }

    /// Makes sure a fresh artifact exists for `request`.
    ///
    /// The freshness is checked in memory first, then on disk. Otherwise, the artifact is
    /// populated, or a population that is already running is joined. This waits at most `wait`
    /// for the population, which continues in the background if the wait times out.
    ///
    /// # Errors
    ///
    /// Every caller waiting on a population receives the same outcome, including its errors.
    pub async fn ensure(&self, request: T, wait: Duration) -> CacheContents<CachedArtifact> {
        let name = self.config.name();
        metric!(counter("caches.access") += 1, "cache" => name.as_ref());

        let key = request.get_cache_key();
        let path = key.cache_path(self.config.cache_dir());

        // `serve` recovers if the artifact was removed from disk since
        if let Some(modified) = self.freshness.fresh_modified(&key) {
            metric!(counter("caches.memory.hit") += 1, "cache" => name.as_ref());
            return Ok(CachedArtifact { path, modified });
        }

        if let Some(modified) = self.lookup_local_cache(&request, &path)? {
            metric!(counter("caches.file.hit") += 1, "cache" => name.as_ref());
            return Ok(CachedArtifact { path, modified });
        }

        metric!(counter("caches.file.miss") += 1, "cache" => name.as_ref());

        let computation = self.spawn_computation(request, key);
        let modified = match tokio::time::timeout(wait, computation).await {
            Ok(result) => result?,
            Err(_elapsed) => {
                metric!(counter("caches.wait.timeout") += 1, "cache" => name.as_ref());
                return Err(CacheError::Timeout(wait));
            }
        };

        Ok(CachedArtifact { path, modified })
    }

    /// Makes sure a fresh artifact exists for `request` and opens it.
    ///
    /// The opened file is unaffected by later populations, as those replace the directory entry
    /// rather than writing into the existing file.
    pub async fn serve(&self, request: T, wait: Duration) -> CacheContents<Artifact> {
        let key = request.get_cache_key();

        // cleanup could remove the artifact between ensuring and opening it
        const MAX_ATTEMPTS: usize = 2;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let artifact = self.ensure(request.clone(), wait).await?;

            match std::fs::File::open(&artifact.path) {
                Ok(file) => {
                    let metadata = file.metadata()?;
                    return Ok(Artifact {
                        file,
                        modified: metadata.modified()?,
                        len: metadata.len(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempt < MAX_ATTEMPTS => {
                    self.freshness.forget(&key);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
