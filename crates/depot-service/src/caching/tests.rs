use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use filetime::FileTime;
use futures::future::{BoxFuture, join_all};
use tempfile::NamedTempFile;

use crate::config::{CacheConfigs, Config, ImagesConfig, RemoteCacheConfig};

use super::*;

const WAIT: Duration = Duration::from_secs(10);

fn tempdir() -> io::Result<tempfile::TempDir> {
    tempfile::tempdir_in(".")
}

fn config(cache_dir: &Path) -> Config {
    Config {
        cache_dir: Some(cache_dir.to_path_buf()),
        ..Default::default()
    }
}

fn remote_cache(cache_dir: &Path, ttl: Duration) -> Cache {
    let config = Config {
        caches: CacheConfigs {
            remote: RemoteCacheConfig {
                ttl,
                ..Default::default()
            },
            ..Default::default()
        },
        ..config(cache_dir)
    };
    Cache::from_config(CacheName::Remote, &config).unwrap()
}

/// Sets the modification time of `path` to `ago` before now.
fn set_age(path: &Path, ago: Duration) {
    let mtime = FileTime::from_system_time(SystemTime::now() - ago);
    filetime::set_file_mtime(path, mtime).unwrap();
}

fn write_cached(cache: &Cache, key: &CacheKey, contents: &str) -> PathBuf {
    let path = key.cache_path(cache.cache_dir());
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
    path
}

#[derive(Debug, Clone)]
struct TestCacheItem {
    key: CacheKey,
    computations: Arc<AtomicUsize>,
    revalidations: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    panicking: Arc<AtomicBool>,
    still_current: bool,
    delay: Duration,
}

impl TestCacheItem {
    fn new(key: &str) -> Self {
        Self {
            key: CacheKey::for_testing(key),
            computations: Default::default(),
            revalidations: Default::default(),
            failing: Default::default(),
            panicking: Default::default(),
            still_current: false,
            delay: Duration::from_millis(100),
        }
    }

    fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    fn revalidations(&self) -> usize {
        self.revalidations.load(Ordering::SeqCst)
    }
}

impl CacheItemRequest for TestCacheItem {
    fn get_cache_key(&self) -> CacheKey {
        self.key.clone()
    }

    fn revalidate(&self, _modified: SystemTime) -> BoxFuture<'_, CacheContents<bool>> {
        self.revalidations.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(self.still_current) })
    }

    fn compute<'a>(&'a self, temp_file: &'a mut NamedTempFile) -> BoxFuture<'a, CacheContents> {
        self.computations.fetch_add(1, Ordering::SeqCst);

        Box::pin(async move {
            temp_file.write_all(b"some new ")?;
            tokio::time::sleep(self.delay).await;

            if self.panicking.load(Ordering::SeqCst) {
                panic!("population of {} panicked", self.key);
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::UpstreamStatus(503));
            }
            temp_file.write_all(b"cached contents")?;
            Ok(())
        })
    }
}

#[test]
fn test_cache_dir_created() {
    let basedir = tempdir().unwrap();
    let cachedir = basedir.path().join("cache");

    let caches = Caches::from_config(&config(&cachedir)).unwrap();

    assert!(cachedir.join("remote").is_dir());
    assert!(cachedir.join("derived").is_dir());
    assert_eq!(caches.remote.tmp_dir(), cachedir.join("tmp"));
}

#[test]
fn test_no_cache_dir() {
    let config = Config {
        cache_dir: None,
        ..Default::default()
    };
    assert!(Caches::from_config(&config).is_err());
}

/// Concurrent accesses to a missing artifact populate it exactly once.
#[tokio::test]
async fn test_single_flight() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cacher = Cacher::new(remote_cache(cache_dir.path(), Duration::from_secs(3600)));
    let request = TestCacheItem::new("global/some_cache_key");

    let results = join_all((0..10).map(|_| cacher.ensure(request.clone(), WAIT))).await;

    assert_eq!(request.computations(), 1);
    let first = results[0].clone().unwrap();
    for result in results {
        assert_eq!(result, Ok(first.clone()));
    }
    assert_eq!(
        fs::read_to_string(&first.path).unwrap(),
        "some new cached contents"
    );
}

/// Every waiter of a failed population receives its error, and the next access tries again.
#[tokio::test]
async fn test_errors_are_broadcast() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cacher = Cacher::new(remote_cache(cache_dir.path(), Duration::from_secs(3600)));
    let request = TestCacheItem::new("global/some_cache_key");
    request.failing.store(true, Ordering::SeqCst);

    let results = join_all((0..5).map(|_| cacher.ensure(request.clone(), WAIT))).await;

    assert_eq!(request.computations(), 1);
    for result in results {
        assert_eq!(result, Err(CacheError::UpstreamStatus(503)));
    }

    // failures are not cached, and the key is not blocked
    request.failing.store(false, Ordering::SeqCst);
    let result = cacher.ensure(request.clone(), WAIT).await;
    assert!(result.is_ok());
    assert_eq!(request.computations(), 2);
}

/// Waiters of a population whose task dies get an internal error, and the key is released.
#[tokio::test]
async fn test_panicking_population() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cacher = Cacher::new(remote_cache(cache_dir.path(), Duration::from_secs(3600)));
    let request = TestCacheItem::new("global/some_cache_key");
    request.panicking.store(true, Ordering::SeqCst);

    let results = join_all((0..5).map(|_| cacher.ensure(request.clone(), WAIT))).await;

    assert_eq!(request.computations(), 1);
    for result in results {
        assert_eq!(result, Err(CacheError::InternalError));
    }

    request.panicking.store(false, Ordering::SeqCst);
    let artifact = cacher.ensure(request.clone(), WAIT).await.unwrap();
    assert_eq!(request.computations(), 2);
    assert_eq!(
        fs::read_to_string(artifact.path).unwrap(),
        "some new cached contents"
    );
}

/// A fresh artifact is served without populating it again.
#[tokio::test]
async fn test_freshness_window() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cacher = Cacher::new(remote_cache(cache_dir.path(), Duration::from_secs(3600)));
    let request = TestCacheItem::new("global/some_cache_key");

    let first = cacher.ensure(request.clone(), WAIT).await.unwrap();
    // even a broken source does not matter within the ttl
    request.failing.store(true, Ordering::SeqCst);
    let second = cacher.ensure(request.clone(), WAIT).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(request.computations(), 1);
    assert_eq!(request.revalidations(), 0);
}

/// Artifacts on disk are picked up without any in-memory record.
#[tokio::test]
async fn test_fresh_file_on_disk() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cache = remote_cache(cache_dir.path(), Duration::from_secs(3600));
    let request = TestCacheItem::new("global/some_cache_key");
    let path = write_cached(&cache, &request.key, "some old cached contents");
    let cacher = Cacher::new(cache);

    let artifact = cacher.ensure(request.clone(), WAIT).await.unwrap();

    assert_eq!(artifact.path, path);
    assert_eq!(request.computations(), 0);
}

/// A stale artifact that its source confirms is kept and touched.
#[tokio::test]
async fn test_revalidation_without_recompute() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cache = remote_cache(cache_dir.path(), Duration::from_secs(3600));
    let mut request = TestCacheItem::new("global/some_cache_key");
    request.still_current = true;
    let path = write_cached(&cache, &request.key, "some old cached contents");
    set_age(&path, Duration::from_secs(2 * 3600));
    let cacher = Cacher::new(cache);

    let artifact = cacher.ensure(request.clone(), WAIT).await.unwrap();

    assert_eq!(request.revalidations(), 1);
    assert_eq!(request.computations(), 0);
    assert_eq!(fs::read_to_string(&path).unwrap(), "some old cached contents");
    let age = SystemTime::now()
        .duration_since(artifact.modified)
        .unwrap_or_default();
    assert!(age < Duration::from_secs(60));

    // the touched file is fresh again
    cacher.ensure(request.clone(), WAIT).await.unwrap();
    assert_eq!(request.revalidations(), 1);
}

/// A stale artifact that its source does not confirm is recomputed.
#[tokio::test]
async fn test_revalidation_fails() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cache = remote_cache(cache_dir.path(), Duration::from_secs(3600));
    let request = TestCacheItem::new("global/some_cache_key");
    let path = write_cached(&cache, &request.key, "some old cached contents");
    set_age(&path, Duration::from_secs(2 * 3600));
    let cacher = Cacher::new(cache);

    cacher.ensure(request.clone(), WAIT).await.unwrap();

    assert_eq!(request.revalidations(), 1);
    assert_eq!(request.computations(), 1);
    assert_eq!(fs::read_to_string(&path).unwrap(), "some new cached contents");
}

/// A zero ttl never trusts an artifact without asking its source.
#[tokio::test]
async fn test_zero_ttl() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cacher = Cacher::new(remote_cache(cache_dir.path(), Duration::ZERO));
    let mut request = TestCacheItem::new("global/some_cache_key");
    request.still_current = true;

    cacher.ensure(request.clone(), WAIT).await.unwrap();
    cacher.ensure(request.clone(), WAIT).await.unwrap();

    assert_eq!(request.computations(), 1);
    assert_eq!(request.revalidations(), 1);
}

/// A caller that stops waiting does not cancel the population.
#[tokio::test]
async fn test_wait_timeout() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cacher = Cacher::new(remote_cache(cache_dir.path(), Duration::from_secs(3600)));
    let mut request = TestCacheItem::new("global/some_cache_key");
    request.delay = Duration::from_millis(300);

    let wait = Duration::from_millis(50);
    let result = cacher.ensure(request.clone(), wait).await;
    assert_eq!(result, Err(CacheError::Timeout(wait)));

    tokio::time::sleep(Duration::from_millis(500)).await;

    let artifact = cacher.ensure(request.clone(), wait).await.unwrap();
    assert_eq!(request.computations(), 1);
    assert_eq!(
        fs::read_to_string(artifact.path).unwrap(),
        "some new cached contents"
    );
}

/// Readers never observe a partially written artifact.
#[tokio::test]
async fn test_population_is_atomic() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cache = remote_cache(cache_dir.path(), Duration::from_secs(3600));
    let mut request = TestCacheItem::new("global/some_cache_key");
    request.delay = Duration::from_millis(300);
    let path = write_cached(&cache, &request.key, "some old cached contents");
    set_age(&path, Duration::from_secs(2 * 3600));
    let cacher = Cacher::new(cache);

    let population = tokio::spawn({
        let cacher = cacher.clone();
        let request = request.clone();
        async move { cacher.ensure(request, WAIT).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(request.computations(), 1);
    assert_eq!(fs::read_to_string(&path).unwrap(), "some old cached contents");

    population.await.unwrap().unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "some new cached contents");
}

/// A failed population leaves the previous artifact and no temporary files behind.
#[tokio::test]
async fn test_failed_population_keeps_previous() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cache = remote_cache(cache_dir.path(), Duration::from_secs(3600));
    let tmp_dir = cache.tmp_dir().to_path_buf();
    let request = TestCacheItem::new("global/some_cache_key");
    request.failing.store(true, Ordering::SeqCst);
    let path = write_cached(&cache, &request.key, "some old cached contents");
    set_age(&path, Duration::from_secs(2 * 3600));
    let cacher = Cacher::new(cache);

    let result = cacher.ensure(request.clone(), WAIT).await;

    assert_eq!(result, Err(CacheError::UpstreamStatus(503)));
    assert_eq!(fs::read_to_string(&path).unwrap(), "some old cached contents");
    assert_eq!(fs::read_dir(tmp_dir).unwrap().count(), 0);
}

/// A recorded artifact is answered from memory, and serving it recovers once it is removed.
#[tokio::test]
async fn test_removed_artifact() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cacher = Cacher::new(remote_cache(cache_dir.path(), Duration::from_secs(3600)));
    let request = TestCacheItem::new("global/some_cache_key");

    let first = cacher.ensure(request.clone(), WAIT).await.unwrap();
    fs::remove_file(&first.path).unwrap();

    // the record is trusted without looking at the disk
    let second = cacher.ensure(request.clone(), WAIT).await.unwrap();
    assert_eq!(second, first);
    assert!(!second.path.exists());
    assert_eq!(request.computations(), 1);

    let mut artifact = cacher.serve(request.clone(), WAIT).await.unwrap();
    let mut contents = String::new();
    io::Read::read_to_string(&mut artifact.file, &mut contents).unwrap();
    assert_eq!(contents, "some new cached contents");
    assert_eq!(request.computations(), 2);
    assert!(first.path.exists());
}

#[tokio::test]
async fn test_serve() {
    depot_test::setup();
    let cache_dir = tempdir().unwrap();
    let cacher = Cacher::new(remote_cache(cache_dir.path(), Duration::from_secs(3600)));
    let request = TestCacheItem::new("global/some_cache_key");

    let mut artifact = cacher.serve(request.clone(), WAIT).await.unwrap();

    let mut contents = String::new();
    io::Read::read_to_string(&mut artifact.file, &mut contents).unwrap();
    assert_eq!(contents, "some new cached contents");
    assert_eq!(artifact.len, contents.len() as u64);
}

#[test]
fn test_clear_tmp() -> Result<()> {
    let tempdir = tempdir()?;
    let caches = Caches::from_config(&config(tempdir.path()))?;
    let leftover = caches.remote.tempfile("")?;
    let (_, leftover_path) = leftover.keep()?;
    assert!(leftover_path.exists());

    caches.clear_tmp()?;

    assert!(!leftover_path.exists());
    assert!(caches.remote.tmp_dir().is_dir());
    Ok(())
}

#[test]
fn test_cleanup_remote() -> Result<()> {
    let tempdir = tempdir()?;
    let cache = remote_cache(tempdir.path(), Duration::from_secs(3600));
    let max_unused_for = cache.max_unused_for().unwrap();

    let keep = write_cached(&cache, &CacheKey::for_testing("a/keep"), "keep");
    let kill = write_cached(&cache, &CacheKey::for_testing("b/kill"), "kill");
    set_age(&kill, max_unused_for + Duration::from_secs(60));

    let stats = cache.cleanup_with_stats(true)?;
    assert_eq!(stats.removed_files, 1);
    assert!(kill.exists());

    let stats = cache.cleanup_with_stats(false)?;
    assert_eq!(stats.removed_files, 1);
    assert_eq!(stats.retained_files, 1);
    assert!(keep.exists());
    assert!(!kill.exists());
    // the emptied directory is removed as well
    assert!(!tempdir.path().join("remote/b").exists());

    Ok(())
}

#[test]
fn test_cleanup_derived() -> Result<()> {
    let tempdir = tempdir()?;
    let source_dir = tempdir.path().join("originals");
    fs::create_dir_all(&source_dir)?;
    let config = Config {
        images: ImagesConfig {
            source_dir: Some(source_dir.clone()),
            ..Default::default()
        },
        ..config(&tempdir.path().join("cache"))
    };
    let cache = Cache::from_config(CacheName::Derived, &config)?;

    let derived = |source: &str| {
        let key = CacheKey::for_derived(&SourcePath::parse(source).unwrap(), 300, "jpg");
        write_cached(&cache, &key, "pixels")
    };

    fs::write(source_dir.join("current.png"), "source")?;
    let current = derived("current.png");
    set_age(&source_dir.join("current.png"), Duration::from_secs(60));

    fs::write(source_dir.join("changed.png"), "source")?;
    let changed = derived("changed.png");
    set_age(&changed, Duration::from_secs(60));

    let orphaned = derived("deleted.png");

    let leftover = cache.cache_dir().join("leftover");
    fs::write(&leftover, "junk")?;

    cache.cleanup(false)?;

    assert!(current.exists());
    assert!(!changed.exists());
    assert!(!orphaned.exists());
    assert!(!leftover.exists());
    assert!(!cache.cache_dir().join("deleted.png").exists());

    Ok(())
}

#[test]
fn test_cleanup_entry() -> Result<()> {
    let tempdir = tempdir()?;
    let config = config(tempdir.path());
    let caches = Caches::from_config(&config)?;
    let kill = write_cached(&caches.remote, &CacheKey::for_testing("a/kill"), "kill");
    set_age(&kill, Duration::from_secs(30 * 24 * 3600));

    cleanup(config, false)?;

    assert!(!kill.exists());
    Ok(())
}
