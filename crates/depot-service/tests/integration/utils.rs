use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use depot_service::config::{Config, ImagesConfig};
use depot_service::services::{SharedServices, create_services};
use depot_test::{Origin, TempDir};
use filetime::FileTime;

/// Everything needed to run depot against a test origin and a directory of source images.
pub struct Setup {
    pub cache_dir: TempDir,
    pub source_dir: TempDir,
    pub origin: Origin,
    pub config: Config,
}

impl Setup {
    /// Creates a new, independent instance of the services on the shared cache directory.
    ///
    /// Nothing is remembered in memory between instances, which is like restarting depot.
    pub fn services(&self) -> SharedServices {
        create_services(&self.config).unwrap()
    }

    /// The number of times the transform program was run.
    pub fn transforms(&self) -> usize {
        match std::fs::read_to_string(self.transform_log()) {
            Ok(log) => log.lines().count(),
            Err(_) => 0,
        }
    }

    pub fn source(&self, name: &str) -> PathBuf {
        self.source_dir.path().join(name)
    }

    fn transform_log(&self) -> PathBuf {
        self.cache_dir.path().join("transforms.log")
    }
}

/// Sets up depot with the origin `test`, and a transform that copies its source while keeping
/// a log of its invocations.
pub fn setup(configure: impl FnOnce(&mut Config)) -> Setup {
    depot_test::setup();
    let cache_dir = depot_test::tempdir();
    let source_dir = depot_test::tempdir();
    let origin = Origin::new();

    let log = cache_dir.path().join("transforms.log");
    let script = format!("echo run >> '{}' && cp \"$0\" \"$1\"", log.display());

    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        origins: [("test".to_string(), origin.base_url())].into(),
        images: ImagesConfig {
            source_dir: Some(source_dir.path().to_path_buf()),
            program: "sh".into(),
            args: vec!["-c".into(), script, "{source}".into(), "{output}".into()],
            ..Default::default()
        },
        ..Default::default()
    };
    configure(&mut config);

    Setup {
        cache_dir,
        source_dir,
        origin,
        config,
    }
}

/// Sets the modification time of `path` to `ago` before now.
pub fn set_age(path: &Path, ago: Duration) {
    let mtime = FileTime::from_system_time(SystemTime::now() - ago);
    filetime::set_file_mtime(path, mtime).unwrap();
}

pub fn modified(path: &Path) -> SystemTime {
    path.metadata().unwrap().modified().unwrap()
}
