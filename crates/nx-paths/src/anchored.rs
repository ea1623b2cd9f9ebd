use std::{borrow::Borrow, fmt, ops::Deref};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::{PathError, RelativeUnixPathBuf};

/// A borrowed path relative to a known anchor directory, in the system
/// separator. The anchor is almost always the workspace root.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct AnchoredSystemPath(Utf8Path);

/// An owned anchored path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AnchoredSystemPathBuf(Utf8PathBuf);

impl AnchoredSystemPath {
    pub fn new<T: AsRef<str> + ?Sized>(value: &T) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(path: &Utf8Path) -> &Self {
        // SAFETY: Self is repr(transparent) over Utf8Path
        unsafe { &*(path as *const Utf8Path as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn parent(&self) -> Option<&AnchoredSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn components(&self) -> impl Iterator<Item = Utf8Component<'_>> {
        self.0.components()
    }

    pub fn join_component(&self, segment: &str) -> AnchoredSystemPathBuf {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        AnchoredSystemPathBuf(self.0.join(segment))
    }

    /// Whether `self` is `other` or one of its ancestors. The empty path
    /// anchors everything.
    pub fn contains(&self, other: &AnchoredSystemPath) -> bool {
        self.0.as_str().is_empty() || other.0.starts_with(&self.0)
    }

    /// Converts to the platform-stable unix form used in hashes and
    /// persisted manifests.
    pub fn to_unix(&self) -> RelativeUnixPathBuf {
        #[cfg(windows)]
        let unix = self.0.as_str().replace('\\', "/");
        #[cfg(not(windows))]
        let unix = self.0.as_str().to_string();
        RelativeUnixPathBuf::new_unchecked(unix)
    }
}

impl AnchoredSystemPathBuf {
    /// Validates a raw string as an anchored path.
    pub fn from_raw(value: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path = value.into();
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.into_string()));
        }
        Ok(Self(path))
    }

    pub fn into_utf8_path_buf(self) -> Utf8PathBuf {
        self.0
    }
}

impl Deref for AnchoredSystemPathBuf {
    type Target = AnchoredSystemPath;

    fn deref(&self) -> &Self::Target {
        AnchoredSystemPath::new_unchecked(&self.0)
    }
}

impl Borrow<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn borrow(&self) -> &AnchoredSystemPath {
        self
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self
    }
}

impl ToOwned for AnchoredSystemPath {
    type Owned = AnchoredSystemPathBuf;

    fn to_owned(&self) -> Self::Owned {
        AnchoredSystemPathBuf(self.0.to_path_buf())
    }
}

impl<'de> Deserialize<'de> for AnchoredSystemPathBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let path = Utf8PathBuf::deserialize(deserializer)?;
        AnchoredSystemPathBuf::from_raw(path).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for AnchoredSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
