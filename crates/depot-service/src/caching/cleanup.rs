use std::fs::{Metadata, read_dir, remove_dir, remove_file};
use std::io;
use std::path::Path;
use std::time::SystemTime;

use anyhow::Result;

use crate::config::Config;

use super::cache_key::DERIVED_VARIANTS_DIR;
use super::freshness::unix_secs;
use super::fs::catch_not_found;
use super::{Cache, CacheName, Caches};

/// Entry function for the cleanup command.
///
/// This will clean up all caches based on configured cache retention.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: Config, dry_run: bool) -> Result<()> {
    Caches::from_config(&config)?.cleanup(dry_run)
}

impl Caches {
    /// Clear the temporary files.
    ///
    /// We need to do this on startup of the main depot process to avoid accidentally
    /// leaving temporary files which survive a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        let tmp = self.remote.tmp_dir();
        if tmp.exists() {
            std::fs::remove_dir_all(tmp)?;
        }
        std::fs::create_dir_all(tmp)?;
        Ok(())
    }

    /// Cleans up all caches based on configured cache retention.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<()> {
        // Destructure so we do not accidentally forget to cleanup one of our members.
        let Self { remote, derived } = self;

        // every cache is attempted even if an earlier one fails
        let mut first_error = None;
        for cache in [remote, derived] {
            if let Err(err) = cache.cleanup(dry_run) {
                let stderr: &dyn std::error::Error = &*err;
                tracing::error!(stderr, "Failed to clean up `{}` cache", cache.name());
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[derive(Debug, Default)]
pub(super) struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl Cache {
    /// Cleans up this cache based on configured cache retention.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<()> {
        self.cleanup_with_stats(dry_run).map(|_| ())
    }

    pub(super) fn cleanup_with_stats(&self, dry_run: bool) -> Result<CleanupStats> {
        tracing::info!("Cleaning up `{}` cache", self.name());

        let mut stats = CleanupStats::default();
        self.cleanup_directory_recursive(self.cache_dir(), &mut stats, dry_run)?;

        tracing::info!("Cleaning up `{}` complete", self.name());
        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        let name = self.name();
        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => name.as_ref());
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => name.as_ref());
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64, "cache" => name.as_ref());
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64, "cache" => name.as_ref());

        Ok(stats)
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty after cleanup.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.cleanup_directory_recursive(&path, stats, dry_run)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if !dry_run {
                        if let Err(e) = remove_dir(&path) {
                            sentry::with_scope(
                                |scope| scope.set_extra("path", path.display().to_string().into()),
                                || tracing::error!("Failed to clean cache directory: {:?}", e),
                            );
                            dir_is_empty = false;
                        }
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats, dry_run) {
                    Err(e) => {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to clean cache file: {:?}", e),
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    ///
    /// If `dry_run` is `true`, the file will not actually be deleted.
    fn try_cleanup_path(
        &self,
        path: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();

        if self.is_expired(path, &metadata)? {
            tracing::debug!("Removing file `{}`", path.display());
            if !dry_run {
                catch_not_found(|| remove_file(path))?;
            }

            stats.removed_bytes += size;
            stats.removed_files += 1;

            return Ok(true);
        }
        stats.retained_bytes += size;
        stats.retained_files += 1;

        Ok(false)
    }

    /// Decides whether the artifact at `path` should be removed.
    ///
    /// Fetched files expire once they were not revalidated for `max_unused_for`. Derived files
    /// expire once their source file is gone or was modified after them. Files that do not
    /// follow the layout of derived files are leftovers and expire as well.
    fn is_expired(&self, path: &Path, metadata: &Metadata) -> io::Result<bool> {
        let modified = metadata.modified()?;

        match self.name() {
            CacheName::Remote => {
                let Some(max_unused_for) = self.max_unused_for() else {
                    return Ok(false);
                };
                let unused_for = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or_default();
                Ok(unused_for > max_unused_for)
            }
            CacheName::Derived => {
                let Some(source_dir) = self.source_dir() else {
                    return Ok(true);
                };
                let Some(source) = derived_source(self.cache_dir(), path) else {
                    return Ok(true);
                };
                match catch_not_found(|| source_dir.join(source).metadata())? {
                    Some(source_metadata) if source_metadata.is_file() => {
                        let source_modified = source_metadata.modified()?;
                        Ok(unix_secs(source_modified) > unix_secs(modified))
                    }
                    _ => Ok(true),
                }
            }
        }
    }
}

/// Recovers the relative source path from the path of a derived artifact.
///
/// Derived artifacts live at `<cache_dir>/<source>/max-side/<N>.<ext>`.
fn derived_source<'a>(cache_dir: &Path, path: &'a Path) -> Option<&'a Path> {
    let relative = path.strip_prefix(cache_dir).ok()?;
    let variants = relative.parent()?;
    if variants.file_name()? != DERIVED_VARIANTS_DIR {
        return None;
    }
    let source = variants.parent()?;
    (!source.as_os_str().is_empty()).then_some(source)
}
