//! # Depot caching infrastructure
//!
//! Depot serves artifacts that are expensive to produce: files fetched from remote origins, and
//! images derived from local source files by an external program. Both are persisted on disk
//! and served from there until they become stale.
//!
//! ## Cache Layers
//!
//! A cache access goes through the following steps:
//!
//! - First, the in-memory [`FreshnessRecord`] is consulted. It remembers when an artifact was
//!   last confirmed to be fresh along with its modification time, and answers without touching
//!   the disk. Derived files are not recorded, as only their source can tell if they are fresh.
//! - On miss, the artifact's modification time on disk is checked by
//!   [`CacheItemRequest::check_freshness`]. Fetched files are fresh for a configured `ttl` after
//!   they were written. Derived files are fresh as long as their source file is not newer.
//! - Otherwise, the artifact is populated. A stale artifact is first revalidated via
//!   [`CacheItemRequest::revalidate`], which for fetched files asks the origin for its
//!   `Last-Modified` time and only touches the local file if it is still current. Failing that,
//!   [`CacheItemRequest::compute`] produces the artifact anew.
//!
//! Populations are deduplicated per [`CacheKey`]: only one population runs at any time, in its
//! own task, and every caller waiting for it receives its outcome, be it success or error.
//! Each caller waits with its own deadline. A caller that gives up does not cancel the
//! population for the others.
//!
//! ### Metrics
//!
//! We collect a couple of metrics, each of those is tagged with a `cache` field that corresponds to
//! the cache name. Here is a list of metrics that are collected:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory freshness record.
//! - `caches.file.hit`: Accesses served by a fresh file on disk.
//! - `caches.file.miss`: Accesses that needed a population, either because the file is missing
//!   or stale (`caches.file.stale`).
//! - `caches.channel.hit` / `caches.channel.miss`: Accesses that joined a running population,
//!   or started a new one.
//! - `caches.revalidated`: Populations that kept the existing file after asking its source.
//! - `caches.computation`: Actual downloads or transforms being run.
//! - `caches.wait.timeout`: Callers that gave up waiting for a population.
//!
//! ## [`CacheKey`] and the disk layout
//!
//! The [`CacheKey`] is used both as the key for the in-memory structures, as well as the path of
//! the file-system cache, relative to the cache's directory. Fetched files are stored at a hash of
//! their URI. Derived files are stored at `<source>/max-side/<N>.<ext>`, which allows to remove
//! all variants of one source by removing a single directory.
//!
//! All artifacts are first written to a temporary file in the `tmp` directory, and are then
//! renamed to their final location. A reader thus either sees the previous artifact, or the
//! complete new one.
//!
//! ## [`CacheContents`] / [`CacheError`]
//!
//! The caching layer primarily deals with [`CacheContents`], which is just an alias for a
//! [`Result`] around a [`CacheError`]. Errors are never persisted: a failed population leaves the
//! previous artifact (if any) in place, and the next access tries again.

use std::io;

use crate::config::Config;

mod cache_error;
mod cache_key;
mod cleanup;
mod config;
mod freshness;
mod fs;
mod memory;
#[cfg(test)]
mod tests;

pub use cache_error::{CacheContents, CacheError};
pub use cache_key::{CacheKey, DERIVED_VARIANTS_DIR, SourcePath};
pub use cleanup::cleanup;
pub use config::CacheName;
pub use freshness::{FreshnessRecord, unix_secs, within_ttl};
pub use fs::Cache;
pub use memory::{Artifact, CacheItemRequest, CachedArtifact, Cacher, Freshness};

/// All the caches of depot.
#[derive(Debug, Clone)]
pub struct Caches {
    /// Files fetched from remote origins.
    pub remote: Cache,
    /// Images derived from local source files.
    pub derived: Cache,
}

impl Caches {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Ok(Self {
            remote: Cache::from_config(CacheName::Remote, config)?,
            derived: Cache::from_config(CacheName::Derived, config)?,
        })
    }
}
