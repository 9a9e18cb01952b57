use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// The range of JPEG qualities the transform may be configured with.
pub const QUALITY_RANGE: std::ops::RangeInclusive<u8> = 50..=100;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for depot.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "depot".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Expiry of files fetched from remote origins.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RemoteCacheConfig {
    /// How long a fetched file is served without asking the origin again.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum duration since the last fetch or revalidation, after which `cleanup` removes a
    /// file. `None` keeps files forever.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,

    /// The number of freshness confirmations kept in memory.
    pub freshness_capacity: u64,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_unused_for: Some(Duration::from_secs(3600 * 24 * 7)),
            freshness_capacity: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configure how long fetched files are cached for.
    ///
    /// Derived images have no settings here, they are compared to their source on every access.
    pub remote: RemoteCacheConfig,
}

/// Configuration of the image transform.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ImagesConfig {
    /// The directory holding the original images.
    ///
    /// Image derivation is disabled if this is not set.
    pub source_dir: Option<PathBuf>,

    /// The sizes that may be requested, in pixels of the longest side.
    pub max_sides: Vec<u32>,

    /// The file extension of derived images, which also decides their content type.
    pub extension: String,

    /// The JPEG quality passed to the transform.
    pub quality: u8,

    /// The transform executable.
    pub program: String,

    /// The arguments of the transform.
    ///
    /// The placeholders `{source}`, `{output}`, `{max_side}` and `{quality}` are replaced
    /// before invoking `program`.
    pub args: Vec<String>,

    /// The maximum time a single transform may take.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            source_dir: None,
            max_sides: vec![300, 600, 1200],
            extension: "jpg".into(),
            quality: 80,
            program: "convert".into(),
            args: [
                "-resize",
                "{max_side}x{max_side}>",
                "-quality",
                "{quality}",
                "-alpha",
                "remove",
                "-background",
                "white",
                "{source}",
                "{output}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching. Required to run the server.
    pub cache_dir: Option<PathBuf>,

    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune cache expiry
    pub caches: CacheConfigs,

    /// The origins that files may be fetched from, by name.
    pub origins: BTreeMap<String, Url>,

    /// Image derivation settings.
    pub images: ImagesConfig,

    /// Skip verification of TLS certificates of origins.
    pub accept_invalid_certs: bool,

    /// The maximum timeout for downloads, including the time to read the whole body.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The timeout for establishing a connection in a download.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for receiving response headers, both for revalidation `HEAD` requests and
    /// for downloads.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,

    /// How long a request waits for a running population of its artifact.
    ///
    /// The population itself continues for other waiters when this elapses.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }

    /// Checks settings that are well-formed YAML but cannot work.
    pub fn validate(&self) -> Result<()> {
        let images = &self.images;

        if images.max_sides.is_empty() {
            anyhow::bail!("images.max_sides must not be empty");
        }
        if images.max_sides.contains(&0) {
            anyhow::bail!("images.max_sides must not contain 0");
        }
        if !QUALITY_RANGE.contains(&images.quality) {
            anyhow::bail!(
                "images.quality must be between {} and {}",
                QUALITY_RANGE.start(),
                QUALITY_RANGE.end()
            );
        }
        if images.program.trim().is_empty() {
            anyhow::bail!("images.program must not be empty");
        }
        for placeholder in ["{source}", "{output}"] {
            if !images.args.iter().any(|arg| arg == placeholder) {
                anyhow::bail!("images.args must contain {placeholder} as a separate argument");
            }
        }
        let extension_ok = !images.extension.is_empty()
            && images.extension.len() <= 8
            && images.extension.bytes().all(|b| b.is_ascii_alphanumeric());
        if !extension_ok {
            anyhow::bail!("images.extension must be a short alphanumeric string");
        }

        for (name, timeout) in [
            ("wait_timeout", self.wait_timeout),
            ("max_download_timeout", self.max_download_timeout),
            ("connect_timeout", self.connect_timeout),
            ("head_timeout", self.head_timeout),
            ("images.timeout", images.timeout),
        ] {
            if timeout.is_zero() {
                anyhow::bail!("{name} must be greater than 0s");
            }
        }

        // cleanup must not remove files that are still answered from memory
        let remote = &self.caches.remote;
        if remote.max_unused_for.is_some_and(|max| max < remote.ttl) {
            anyhow::bail!("caches.remote.max_unused_for must not be shorter than its ttl");
        }

        for (name, url) in &self.origins {
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("origin `{name}` must be an http or https URL");
            }
        }

        Ok(())
    }
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:3021".to_owned()
    } else {
        "127.0.0.1:3021".to_owned()
    }
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> Option<PathBuf> {
    if is_docker() {
        Some(PathBuf::from("/data"))
    } else {
        None
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            origins: BTreeMap::new(),
            images: ImagesConfig::default(),
            accept_invalid_certs: false,
            max_download_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            head_timeout: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
