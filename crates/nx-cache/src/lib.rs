//! Content-addressed task cache.
//!
//! A cache entry is a directory named by the task hash:
//!
//! ```text
//! <cacheDir>/
//!   <hash>/
//!     terminal-output.log         captured terminal stream
//!     outputs/                    restored payload, workspace-relative
//!     outputs.manifest.json       { paths, sizes, hashes }
//!     meta.json                   { status, exitCode, createdAt }
//! ```
//!
//! The store is append-only: entries are assembled in a temp directory and
//! published with an atomic rename, and an existing entry is never replaced.
//! A remote tier is optional; when present, reads fall through local→remote
//! and writes mirror.

mod async_cache;
pub mod fs;
mod multiplexer;
mod remote;

pub use async_cache::AsyncCache;
pub use fs::{CacheMetadata, FsCache, OutputsManifest};
pub use multiplexer::CacheMultiplexer;
use nxpath::AnchoredSystemPathBuf;
pub use remote::RemoteCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
    #[error("invalid cache path: {0}")]
    Path(#[from] nxpath::PathError),
    #[error("invalid cache metadata: {0}")]
    InvalidMetadata(serde_json::Error),
    #[error("unable to write cache metadata: {0}")]
    MetadataWriteFailure(serde_json::Error),
    #[error("cache artifact for {0} is malformed")]
    MalformedArtifact(String),
    #[error("remote cache error: {0}")]
    Remote(String),
    #[error("unable to perform write as cache is shutting down")]
    CacheShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    /// Milliseconds the original task run took; what a hit saves.
    pub time_saved: u64,
}

/// A successful fetch: where it came from and what was restored.
#[derive(Debug)]
pub struct CacheHit {
    pub metadata: CacheHitMetadata,
    pub restored_files: Vec<AnchoredSystemPathBuf>,
    pub terminal_output: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct CacheOpts {
    /// Cache directory, workspace-root relative.
    pub cache_dir: AnchoredSystemPathBuf,
    /// Size of the write-behind worker pool.
    pub workers: u32,
    /// Read from the remote tier but never write to it.
    pub remote_read_only: bool,
}
