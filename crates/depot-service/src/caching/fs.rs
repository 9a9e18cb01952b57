use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::Config;

use super::CacheName;

/// The on-disk part of a cache.
///
/// Every cache owns one subdirectory of the configured cache root. New artifacts are first
/// written to a temporary file in the shared `tmp` sibling directory, and are then atomically
/// renamed to their final location, so readers never observe a partially written file.
#[derive(Debug, Clone)]
pub struct Cache {
    /// Cache identifier used for metric names and the directory name.
    name: CacheName,

    /// Directory to use for storing cache items. Will be created if it does not exist.
    cache_dir: PathBuf,

    /// Directory to use for temporary files.
    ///
    /// This lives on the same file system as `cache_dir`, which makes renames atomic.
    tmp_dir: PathBuf,

    /// How long an artifact is considered fresh after it was written or revalidated.
    ttl: Duration,

    /// How long an artifact may go without being written or revalidated before it is cleaned up.
    max_unused_for: Option<Duration>,

    /// The directory derived artifacts are computed from.
    ///
    /// Cleanup removes derived artifacts whose source is gone or was modified.
    source_dir: Option<PathBuf>,

    /// The capacity of the in-memory freshness record.
    pub(super) freshness_capacity: u64,
}

impl Cache {
    pub fn from_config(name: CacheName, config: &Config) -> io::Result<Self> {
        let (Some(cache_dir), Some(tmp_dir)) =
            (config.cache_dir(name.as_ref()), config.cache_dir("tmp"))
        else {
            return Err(io::Error::other("no cache_dir configured"));
        };
        std::fs::create_dir_all(&cache_dir)?;

        let (ttl, max_unused_for, source_dir, freshness_capacity) = match name {
            CacheName::Remote => {
                let remote = &config.caches.remote;
                (
                    remote.ttl,
                    remote.max_unused_for,
                    None,
                    remote.freshness_capacity,
                )
            }
            // a memory record could not notice changes of the source
            CacheName::Derived => (
                Duration::ZERO,
                None,
                config.images.source_dir.clone(),
                0,
            ),
        };

        Ok(Cache {
            name,
            cache_dir,
            tmp_dir,
            ttl,
            max_unused_for,
            source_dir,
            freshness_capacity,
        })
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_unused_for(&self) -> Option<Duration> {
        self.max_unused_for
    }

    pub fn source_dir(&self) -> Option<&Path> {
        self.source_dir.as_deref()
    }

    /// Returns the modification time of the file at `path`, or `None` if it does not exist.
    pub(super) fn modified(&self, path: &Path) -> io::Result<Option<SystemTime>> {
        catch_not_found(|| {
            let metadata = path.metadata()?;
            tracing::trace!("File `{}` length: {}", path.display(), metadata.len());
            metadata.modified()
        })
    }

    /// Sets the modification time of the file at `path` to now.
    ///
    /// Returns `false` if the file does not exist anymore.
    pub(super) fn touch(&self, path: &Path) -> io::Result<bool> {
        catch_not_found(|| filetime::set_file_mtime(path, FileTime::now()))
            .map(|touched| touched.is_some())
    }

    /// Create a new temporary file to use in the cache.
    ///
    /// The `suffix` is appended to the random file name, which allows external programs to infer
    /// the format of their output from the file name.
    pub fn tempfile(&self, suffix: &str) -> io::Result<NamedTempFile> {
        let path = &self.tmp_dir;
        // A concurrent `cleanup` may remove the parent directories we are operating in, so the
        // fs operations are retried.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(path) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .suffix(suffix)
                .tempfile_in(path)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}

/// Atomically moves `temp_file` to `cache_path`, creating parent directories as needed.
///
/// Readers of `cache_path` observe either the previous file or the complete new one.
pub(super) fn persist_tempfile(
    mut temp_file: NamedTempFile,
    cache_path: &Path,
) -> io::Result<()> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // A concurrent `cleanup` may remove the parent directories we are operating in, so the
    // fs operations are retried.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
