use async_trait::async_trait;

use crate::CacheError;

/// The optional remote tier. Implementations move packed entry artifacts
/// (`FsCache::pack_entry` / `unpack_entry` form) to and from shared storage.
/// The orchestrator core ships no concrete transport; hosts provide one.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn exists(&self, hash: &str) -> Result<bool, CacheError>;

    /// Fetches the packed artifact for `hash`, or `None` on a miss.
    async fn fetch(&self, hash: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, hash: &str, artifact: Vec<u8>) -> Result<(), CacheError>;
}
