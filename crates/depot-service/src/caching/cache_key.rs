use std::fmt::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

use super::{CacheContents, CacheError};

/// The longest file extension that is carried over from a remote URI into its cache path.
const MAX_EXTENSION_LEN: usize = 8;

/// The directory name separating a source path from its derived variants.
pub const DERIVED_VARIANTS_DIR: &str = "max-side";

/// A validated path relative to some root directory.
///
/// A `SourcePath` consists only of plain file name segments: it is never absolute, and it never
/// contains `..`, backslashes or NUL bytes. Empty and `.` segments are dropped while parsing.
/// Joining it onto any directory yields a descendant of that directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourcePath(Arc<str>);

impl SourcePath {
    /// Parses a `/` separated relative path, rejecting anything that could leave its root.
    pub fn parse(raw: &str) -> CacheContents<Self> {
        if raw.starts_with('/') {
            return Err(CacheError::InvalidKey);
        }

        let mut normalized = String::with_capacity(raw.len());
        for segment in raw.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if !is_safe_segment(segment) {
                tracing::debug!("Rejecting unsafe path segment in `{raw}`");
                return Err(CacheError::InvalidKey);
            }
            if !normalized.is_empty() {
                normalized.push('/');
            }
            normalized.push_str(segment);
        }

        if normalized.is_empty() {
            return Err(CacheError::InvalidKey);
        }

        Ok(Self(normalized.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves this path below `root`.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(&*self.0)
    }
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `segment` is a single, plain file name on every platform we care about.
fn is_safe_segment(segment: &str) -> bool {
    if segment.contains(['\\', '\0']) {
        return false;
    }
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Identifies a single artifact in a cache directory.
///
/// The key carries the relative path at which the artifact is stored, and some human-readable
/// metadata describing where the artifact comes from. Two keys are equal exactly when their
/// paths are equal, and different logical inputs always produce different paths:
///
/// - Remote files are stored at a SHA-256 hash of their URI, formatted like
///   `aa/bbccdd/eeff...[.ext]`.
/// - Derived files are stored at `<source path>/max-side/<N>.<ext>`. Keeping the source path as
///   prefix allows dropping every derived variant of a source by removing one directory.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    relative_path: Arc<str>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.relative_path == other.relative_path
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.relative_path.hash(state);
    }
}

impl CacheKey {
    /// Creates the key for a file fetched from `uri`.
    ///
    /// Only `http` and `https` URIs can be fetched.
    pub fn for_remote(uri: &Url) -> CacheContents<Self> {
        if !matches!(uri.scheme(), "http" | "https") {
            return Err(CacheError::InvalidKey);
        }

        let metadata = format!("uri: {uri}\n");
        let hash = Sha256::digest(metadata.as_bytes());

        let mut path = format!("{:02x}/", hash[0]);
        for b in &hash[1..4] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path.push('/');
        for b in &hash[4..] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        if let Some(ext) = remote_extension(uri) {
            path.push('.');
            path.push_str(&ext);
        }

        Ok(Self {
            metadata: metadata.into(),
            relative_path: path.into(),
        })
    }

    /// Creates the key for the variant of `source` whose longest side is `max_side` pixels.
    pub fn for_derived(source: &SourcePath, max_side: u32, extension: &str) -> Self {
        debug_assert!(is_safe_segment(extension));
        let metadata = format!("source: {source}\nmax_side: {max_side}\n");
        let relative_path = format!("{source}/{DERIVED_VARIANTS_DIR}/{max_side}.{extension}");

        Self {
            metadata: metadata.into(),
            relative_path: relative_path.into(),
        }
    }

    /// Returns the human-readable metadata that describes this key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the path of this key relative to its cache directory.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Returns the full path of this key inside of `cache_dir`.
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(&*self.relative_path)
    }

    #[cfg(test)]
    pub fn for_testing(key: &str) -> Self {
        let source = SourcePath::parse(key).unwrap();
        Self {
            metadata: format!("test: {key}\n").into(),
            relative_path: source.as_str().into(),
        }
    }
}

/// Extracts a lowercase, alphanumeric file extension from the last segment of `uri`.
fn remote_extension(uri: &Url) -> Option<String> {
    let last_segment = uri.path_segments()?.next_back()?;
    let (stem, ext) = last_segment.rsplit_once('.')?;
    let valid = !stem.is_empty()
        && !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.bytes().all(|b| b.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}
