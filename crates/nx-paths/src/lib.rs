//! Typed path handling for the workspace orchestrator.
//!
//! Defines distinct path types for the different uses of paths in the tool:
//!
//! - `AbsoluteSystemPath(Buf)`: absolute, system separator. Used for touching
//!   the filesystem.
//! - `AnchoredSystemPath(Buf)`: relative to a specific directory (almost
//!   always the workspace root), system separator.
//! - `RelativeUnixPath(Buf)`: relative, unix separator. Used wherever a path
//!   becomes part of a hash, a cache manifest, or a persisted graph so that
//!   the bytes are identical across hosts.
//!
//! As in `std::path` there are `Path` and `PathBuf` variants of each type for
//! the borrowed and owned cases. Construction validates; the `new_unchecked`
//! casts are private to this crate.

mod absolute;
mod anchored;
mod relative_unix;

use std::io;

pub use absolute::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
pub use anchored::{AnchoredSystemPath, AnchoredSystemPathBuf};
pub use relative_unix::{RelativeUnixPath, RelativeUnixPathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path is non-UTF-8: {0}")]
    InvalidUnicode(String),
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("path is not relative: {0}")]
    NotRelative(String),
    #[error("path {0} is not a unix-style relative path")]
    NotUnix(String),
    #[error("{0} is not a prefix of {1}")]
    NotParent(String, String),
    #[error("io error: {0}")]
    IO(#[from] io::Error),
}

impl PathError {
    pub fn is_io_error(&self, kind: io::ErrorKind) -> bool {
        matches!(self, PathError::IO(err) if err.kind() == kind)
    }

    pub fn invalid_utf8(path: &std::path::Path) -> Self {
        PathError::InvalidUnicode(path.to_string_lossy().into_owned())
    }
}
