use std::fmt;

/// All known cache names.
///
/// The name is also the name of the cache's subdirectory below the cache root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheName {
    /// Files fetched from remote origins.
    Remote,
    /// Images derived from local source files.
    Derived,
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        match self {
            Self::Remote => "remote",
            Self::Derived => "derived",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
