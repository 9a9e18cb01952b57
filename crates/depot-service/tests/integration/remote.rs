use std::io::Read;
use std::time::{Duration, SystemTime};

use depot_service::caching::CacheError;
use futures::future::join_all;

use crate::{modified, set_age, setup};

#[tokio::test]
async fn test_fetch_and_serve() {
    let setup = setup(|_| ());
    setup.origin.put("hello.txt", "hello world\n");
    let services = setup.services();

    let uri = services.remote.origin_url("test", "hello.txt", None).unwrap();
    let before = SystemTime::now() - Duration::from_secs(1);
    let mut artifact = services.remote.serve(uri.clone()).await.unwrap();

    let mut contents = String::new();
    artifact.file.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "hello world\n");
    assert!(artifact.modified >= before);

    // within the ttl, even a broken origin does not matter
    setup.origin.set_failing(true);
    let again = services.remote.ensure(uri).await.unwrap();
    assert_eq!(again.modified, artifact.modified);
    assert_eq!(setup.origin.gets("/hello.txt"), 1);
}

#[tokio::test]
async fn test_concurrent_fetches() {
    let setup = setup(|_| ());
    setup.origin.put("slow.txt", "slow\n");
    setup.origin.set_delay(Duration::from_millis(100));
    let services = setup.services();

    let uri = services.remote.origin_url("test", "slow.txt", None).unwrap();
    let results = join_all((0..10).map(|_| services.remote.ensure(uri.clone()))).await;

    assert_eq!(setup.origin.gets("/slow.txt"), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert_eq!(result.as_ref(), Ok(first));
    }
}

#[tokio::test]
async fn test_concurrent_failures() {
    let setup = setup(|_| ());
    setup.origin.put("slow.txt", "slow\n");
    setup.origin.set_delay(Duration::from_millis(100));
    setup.origin.set_failing(true);
    let services = setup.services();

    let uri = services.remote.origin_url("test", "slow.txt", None).unwrap();
    let results = join_all((0..5).map(|_| services.remote.ensure(uri.clone()))).await;

    assert_eq!(setup.origin.gets("/slow.txt"), 1);
    for result in results {
        assert_eq!(result, Err(CacheError::UpstreamStatus(503)));
    }

    // failures are not cached
    setup.origin.set_failing(false);
    assert!(services.remote.ensure(uri).await.is_ok());
    assert_eq!(setup.origin.gets("/slow.txt"), 2);
}

#[tokio::test]
async fn test_revalidation_without_download() {
    let setup = setup(|_| ());
    setup.origin.put("hello.txt", "hello world\n");
    let uri = setup
        .services()
        .remote
        .origin_url("test", "hello.txt", None)
        .unwrap();

    let artifact = setup.services().remote.ensure(uri.clone()).await.unwrap();
    set_age(&artifact.path, Duration::from_secs(2 * 3600));
    let aged = modified(&artifact.path);

    setup
        .origin
        .set_last_modified(Some(SystemTime::now() - Duration::from_secs(3 * 3600)));
    let revalidated = setup.services().remote.ensure(uri).await.unwrap();

    assert_eq!(revalidated.path, artifact.path);
    assert!(revalidated.modified > aged);
    assert!(modified(&artifact.path) > aged);
    assert_eq!(setup.origin.heads("/hello.txt"), 1);
    assert_eq!(setup.origin.gets("/hello.txt"), 1);
}

#[tokio::test]
async fn test_revalidation_with_newer_origin() {
    let setup = setup(|_| ());
    setup.origin.put("hello.txt", "hello world\n");
    let services = setup.services();
    let uri = services.remote.origin_url("test", "hello.txt", None).unwrap();

    let artifact = services.remote.ensure(uri.clone()).await.unwrap();
    set_age(&artifact.path, Duration::from_secs(2 * 3600));

    setup.origin.put("hello.txt", "hello again\n");
    setup.origin.set_last_modified(Some(SystemTime::now()));
    let refetched = setup.services().remote.ensure(uri).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(&refetched.path).unwrap(),
        "hello again\n"
    );
    assert_eq!(setup.origin.heads("/hello.txt"), 1);
    assert_eq!(setup.origin.gets("/hello.txt"), 2);
}

#[tokio::test]
async fn test_revalidation_without_last_modified() {
    let setup = setup(|_| ());
    setup.origin.put("hello.txt", "hello world\n");
    let uri = setup
        .services()
        .remote
        .origin_url("test", "hello.txt", None)
        .unwrap();

    let artifact = setup.services().remote.ensure(uri.clone()).await.unwrap();
    set_age(&artifact.path, Duration::from_secs(2 * 3600));

    setup.services().remote.ensure(uri).await.unwrap();
    assert_eq!(setup.origin.heads("/hello.txt"), 1);
    assert_eq!(setup.origin.gets("/hello.txt"), 2);
}

#[tokio::test]
async fn test_removed_at_origin() {
    let setup = setup(|_| ());
    setup.origin.put("hello.txt", "hello world\n");
    let uri = setup
        .services()
        .remote
        .origin_url("test", "hello.txt", None)
        .unwrap();

    let artifact = setup.services().remote.ensure(uri.clone()).await.unwrap();
    set_age(&artifact.path, Duration::from_secs(2 * 3600));

    setup.origin.remove("hello.txt");
    assert_eq!(
        setup.services().remote.ensure(uri).await,
        Err(CacheError::NotFound)
    );
    assert_eq!(setup.origin.heads("/hello.txt"), 1);
}

#[tokio::test]
async fn test_waiting_times_out() {
    let setup = setup(|config| config.wait_timeout = Duration::from_millis(100));
    setup.origin.put("slow.txt", "slow\n");
    setup.origin.set_delay(Duration::from_millis(500));
    let services = setup.services();
    let uri = services.remote.origin_url("test", "slow.txt", None).unwrap();

    let result = services.remote.ensure(uri.clone()).await;
    assert_eq!(result, Err(CacheError::Timeout(Duration::from_millis(100))));

    // the download continued without anybody waiting for it
    tokio::time::sleep(Duration::from_millis(800)).await;
    let artifact = services.remote.ensure(uri).await.unwrap();
    assert_eq!(std::fs::read_to_string(&artifact.path).unwrap(), "slow\n");
    assert_eq!(setup.origin.gets("/slow.txt"), 1);
}

#[tokio::test]
async fn test_rejects_traversal() {
    let setup = setup(|_| ());
    let services = setup.services();

    for path in ["../../etc/passwd", "a/../../etc/passwd", "/etc/passwd"] {
        assert_eq!(
            services.remote.origin_url("test", path, None),
            Err(CacheError::InvalidKey),
            "{path}"
        );
    }
}
