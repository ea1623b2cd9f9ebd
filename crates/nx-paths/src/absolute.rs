use std::{
    borrow::Borrow,
    fmt, fs, io,
    ops::Deref,
    path::{Path, PathBuf},
};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::{AnchoredSystemPath, AnchoredSystemPathBuf, PathError};

/// A borrowed absolute path using the system separator.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct AbsoluteSystemPath(Utf8Path);

/// An owned absolute path using the system separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AbsoluteSystemPathBuf(Utf8PathBuf);

impl AbsoluteSystemPath {
    /// Validates that the given path is absolute.
    pub fn new<T: AsRef<str> + ?Sized>(value: &T) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub fn from_std_path(path: &Path) -> Result<&Self, PathError> {
        let path = Utf8Path::from_path(path).ok_or_else(|| PathError::invalid_utf8(path))?;
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    fn new_unchecked(path: &Utf8Path) -> &Self {
        // SAFETY: Self is repr(transparent) over Utf8Path
        unsafe { &*(path as *const Utf8Path as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn parent(&self) -> Option<&AbsoluteSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    /// Iterator over self and all ancestor directories.
    pub fn ancestors(&self) -> impl Iterator<Item = &AbsoluteSystemPath> {
        self.0.ancestors().map(Self::new_unchecked)
    }

    /// Joins a single path component. The component must not contain a
    /// separator; `join_components` exists for multi-segment appends.
    pub fn join_component(&self, segment: &str) -> AbsoluteSystemPathBuf {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        AbsoluteSystemPathBuf(self.0.join(segment))
    }

    pub fn join_components(&self, segments: &[&str]) -> AbsoluteSystemPathBuf {
        let mut path = self.0.to_path_buf();
        for segment in segments {
            debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
            path.push(segment);
        }
        AbsoluteSystemPathBuf(path)
    }

    /// Resolves an anchored path against this path as the anchor.
    pub fn resolve(&self, anchored: &AnchoredSystemPath) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf(self.0.join(anchored.as_path()))
    }

    /// Produces the anchored path of `target` relative to `self`. Fails if
    /// `self` is not an ancestor of `target`.
    pub fn anchor(&self, target: &AbsoluteSystemPath) -> Result<AnchoredSystemPathBuf, PathError> {
        let stripped = target
            .0
            .strip_prefix(&self.0)
            .map_err(|_| PathError::NotParent(self.to_string(), target.to_string()))?;
        AnchoredSystemPathBuf::from_raw(stripped.as_str())
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    pub fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.0.is_file()
    }

    pub fn create_dir_all(&self) -> Result<(), io::Error> {
        fs::create_dir_all(&self.0)
    }

    pub fn remove_file(&self) -> Result<(), io::Error> {
        fs::remove_file(&self.0)
    }

    pub fn remove_dir_all(&self) -> Result<(), io::Error> {
        fs::remove_dir_all(&self.0)
    }

    pub fn read(&self) -> Result<Vec<u8>, io::Error> {
        fs::read(&self.0)
    }

    pub fn read_to_string(&self) -> Result<String, io::Error> {
        fs::read_to_string(&self.0)
    }

    /// Creates the file, truncating if it exists. Parent directories must
    /// already exist.
    pub fn create_with_contents(&self, contents: impl AsRef<[u8]>) -> Result<(), io::Error> {
        fs::write(&self.0, contents.as_ref())
    }

    pub fn rename(&self, to: &AbsoluteSystemPath) -> Result<(), io::Error> {
        fs::rename(&self.0, &to.0)
    }

    pub fn metadata(&self) -> Result<fs::Metadata, io::Error> {
        fs::metadata(&self.0)
    }

    pub fn read_dir(&self) -> Result<fs::ReadDir, io::Error> {
        fs::read_dir(self.as_std_path())
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }
}

impl AbsoluteSystemPathBuf {
    pub fn new(value: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path = value.into();
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.into_string()));
        }
        Ok(Self(path))
    }

    pub fn from_std_path(path: impl Into<PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        let path =
            Utf8PathBuf::from_path_buf(path).map_err(|p| PathError::invalid_utf8(p.as_path()))?;
        Self::new(path)
    }

    /// The current working directory.
    pub fn cwd() -> Result<Self, PathError> {
        Self::from_std_path(std::env::current_dir()?)
    }

    pub fn into_utf8_path_buf(self) -> Utf8PathBuf {
        self.0
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        AbsoluteSystemPath::new_unchecked(&self.0)
    }
}

impl Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl ToOwned for AbsoluteSystemPath {
    type Owned = AbsoluteSystemPathBuf;

    fn to_owned(&self) -> Self::Owned {
        AbsoluteSystemPathBuf(self.0.to_path_buf())
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(Utf8PathBuf::from(value))
    }
}

impl<'de> Deserialize<'de> for AbsoluteSystemPathBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let path = Utf8PathBuf::deserialize(deserializer)?;
        AbsoluteSystemPathBuf::new(path).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for AbsoluteSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_rejects_relative() {
        assert!(AbsoluteSystemPath::new("some/relative/path").is_err());
        assert!(AbsoluteSystemPathBuf::new("another/one").is_err());
        assert!(AbsoluteSystemPath::new("/rooted").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_anchor_and_resolve_round_trip() {
        let root = AbsoluteSystemPath::new("/repo").unwrap();
        let file = AbsoluteSystemPath::new("/repo/libs/a/index.ts").unwrap();
        let anchored = root.anchor(file).unwrap();
        assert_eq!(anchored.as_str(), "libs/a/index.ts");
        assert_eq!(root.resolve(&anchored).as_str(), "/repo/libs/a/index.ts");
    }

    #[cfg(unix)]
    #[test]
    fn test_anchor_requires_ancestor() {
        let root = AbsoluteSystemPath::new("/repo").unwrap();
        let outside = AbsoluteSystemPath::new("/elsewhere/file").unwrap();
        assert!(root.anchor(outside).is_err());
    }

    #[test]
    fn test_fs_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
        let nested = root.join_components(&["a", "b"]);
        nested.create_dir_all().unwrap();
        let file = nested.join_component("f.txt");
        file.create_with_contents("hello").unwrap();
        assert_eq!(file.read_to_string().unwrap(), "hello");
        let renamed = nested.join_component("g.txt");
        file.rename(&renamed).unwrap();
        assert!(!file.exists());
        assert_eq!(renamed.read_to_string().unwrap(), "hello");
    }
}
