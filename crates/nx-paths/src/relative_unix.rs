use std::{borrow::Borrow, fmt, ops::Deref};

use serde::{Deserialize, Serialize};

use crate::{AnchoredSystemPathBuf, PathError};

/// A borrowed relative path with unix separators. This is the only path type
/// whose bytes are stable across hosts, so it is the form that enters hashes,
/// cache manifests, and the persisted project graph.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RelativeUnixPath(str);

/// An owned relative unix path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RelativeUnixPathBuf(String);

impl RelativeUnixPath {
    pub fn new(value: &str) -> Result<&Self, PathError> {
        if value.starts_with('/') {
            return Err(PathError::NotRelative(value.to_string()));
        }
        if value.contains('\\') {
            return Err(PathError::NotUnix(value.to_string()));
        }
        Ok(Self::new_unchecked(value))
    }

    fn new_unchecked(value: &str) -> &Self {
        // SAFETY: Self is repr(transparent) over str
        unsafe { &*(value as *const str as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn extension(&self) -> Option<&str> {
        let file_name = self.0.rsplit('/').next()?;
        let (stem, ext) = file_name.rsplit_once('.')?;
        (!stem.is_empty()).then_some(ext)
    }

    /// Converts into the system-separator anchored form.
    pub fn to_system(&self) -> AnchoredSystemPathBuf {
        #[cfg(windows)]
        let system = self.0.replace('/', "\\");
        #[cfg(not(windows))]
        let system = self.0.to_string();
        AnchoredSystemPathBuf::from_raw(system)
            .expect("relative unix paths are valid anchored paths")
    }

    pub fn join(&self, segment: &str) -> RelativeUnixPathBuf {
        if self.0.is_empty() {
            RelativeUnixPathBuf(segment.to_string())
        } else {
            RelativeUnixPathBuf(format!("{}/{}", &self.0, segment))
        }
    }

    /// Whether `self` is `other` or one of its directory ancestors.
    pub fn contains(&self, other: &RelativeUnixPath) -> bool {
        self.0.is_empty()
            || other.0 == self.0
            || other
                .0
                .strip_prefix(&self.0)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl RelativeUnixPathBuf {
    pub fn new(value: impl Into<String>) -> Result<Self, PathError> {
        let value = value.into();
        RelativeUnixPath::new(&value)?;
        Ok(Self(value))
    }

    pub(crate) fn new_unchecked(value: String) -> Self {
        Self(value)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Deref for RelativeUnixPathBuf {
    type Target = RelativeUnixPath;

    fn deref(&self) -> &Self::Target {
        RelativeUnixPath::new_unchecked(&self.0)
    }
}

impl Borrow<RelativeUnixPath> for RelativeUnixPathBuf {
    fn borrow(&self) -> &RelativeUnixPath {
        self
    }
}

impl AsRef<RelativeUnixPath> for RelativeUnixPathBuf {
    fn as_ref(&self) -> &RelativeUnixPath {
        self
    }
}

impl ToOwned for RelativeUnixPath {
    type Owned = RelativeUnixPathBuf;

    fn to_owned(&self) -> Self::Owned {
        RelativeUnixPathBuf(self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for RelativeUnixPathBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        RelativeUnixPathBuf::new(value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for RelativeUnixPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for RelativeUnixPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
