use std::time::Duration;

use depot_service::caching::CacheError;
use futures::future::join_all;

use crate::{set_age, setup};

#[tokio::test]
async fn test_allowed_sizes_only() {
    let setup = setup(|_| ());
    std::fs::write(setup.source("cat.png"), "pixels").unwrap();
    let services = setup.services();

    let result = services.images.ensure("cat.png", 9999).await;
    assert_eq!(result, Err(CacheError::InvalidKey));
    assert_eq!(setup.transforms(), 0);
}

#[tokio::test]
async fn test_derive_once() {
    let setup = setup(|_| ());
    std::fs::write(setup.source("cat.png"), "pixels").unwrap();
    let services = setup.services();

    let results = join_all((0..10).map(|_| services.images.ensure("cat.png", 300))).await;
    assert_eq!(setup.transforms(), 1);
    for result in &results {
        assert!(result.is_ok());
    }

    let artifact = services.images.serve("cat.png", 300).await.unwrap();
    assert_eq!(artifact.len, 6);
    assert_eq!(setup.transforms(), 1);

    // a restart keeps using the variant on disk
    setup.services().images.ensure("cat.png", 300).await.unwrap();
    assert_eq!(setup.transforms(), 1);
}

#[tokio::test]
async fn test_sizes_are_separate_variants() {
    let setup = setup(|_| ());
    std::fs::write(setup.source("cat.png"), "pixels").unwrap();
    let services = setup.services();

    let small = services.images.ensure("cat.png", 300).await.unwrap();
    let large = services.images.ensure("cat.png", 1200).await.unwrap();

    assert_ne!(small.path, large.path);
    assert!(small.path.ends_with("cat.png/max-side/300.jpg"));
    assert!(large.path.ends_with("cat.png/max-side/1200.jpg"));
    assert_eq!(setup.transforms(), 2);
}

#[tokio::test]
async fn test_modified_source() {
    let setup = setup(|_| ());
    let source = setup.source("cat.png");
    std::fs::write(&source, "old pixels").unwrap();
    let services = setup.services();

    let artifact = services.images.ensure("cat.png", 300).await.unwrap();
    set_age(&artifact.path, Duration::from_secs(60));

    std::fs::write(&source, "new pixels").unwrap();
    let artifact = services.images.ensure("cat.png", 300).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(&artifact.path).unwrap(),
        "new pixels"
    );
    assert_eq!(setup.transforms(), 2);
}

#[tokio::test]
async fn test_missing_source() {
    let setup = setup(|_| ());
    let services = setup.services();

    let result = services.images.ensure("missing.png", 300).await;
    assert_eq!(result, Err(CacheError::NotFound));
    assert_eq!(setup.transforms(), 0);
}

#[tokio::test]
async fn test_failing_transform() {
    let setup = setup(|config| {
        config.images.program = "sh".into();
        config.images.args = vec![
            "-c".into(),
            "echo 'no such image' >&2; exit 1".into(),
            "{source}".into(),
            "{output}".into(),
        ];
    });
    std::fs::write(setup.source("cat.png"), "pixels").unwrap();
    let services = setup.services();

    let result = services.images.ensure("cat.png", 300).await;
    assert!(matches!(result, Err(CacheError::TransformFailed(_))));

    let variant = setup.cache_dir.path().join("derived/cat.png/max-side/300.jpg");
    assert!(!variant.exists());
}

#[tokio::test]
async fn test_invalidate() {
    let setup = setup(|_| ());
    std::fs::write(setup.source("cat.png"), "pixels").unwrap();
    let services = setup.services();

    services.images.ensure("cat.png", 300).await.unwrap();
    services.images.invalidate("cat.png").unwrap();
    services.images.ensure("cat.png", 300).await.unwrap();

    assert_eq!(setup.transforms(), 2);
}
