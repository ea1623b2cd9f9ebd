//! Combines the filesystem tier with an optional remote tier.

use std::sync::Arc;

use nxpath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use tracing::warn;

use crate::{CacheError, CacheHit, CacheHitMetadata, CacheSource, FsCache, RemoteCache};

pub struct CacheMultiplexer {
    fs: FsCache,
    remote: Option<Arc<dyn RemoteCache>>,
    remote_read_only: bool,
}

impl CacheMultiplexer {
    pub fn new(
        fs: FsCache,
        remote: Option<Arc<dyn RemoteCache>>,
        remote_read_only: bool,
    ) -> Self {
        Self {
            fs,
            remote,
            remote_read_only,
        }
    }

    /// Local first; on a local miss the remote artifact (if any) is pulled
    /// into the local store and restored from there.
    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<CacheHit>, CacheError> {
        if let Some(hit) = self.fs.fetch(anchor, hash)? {
            return Ok(Some(hit));
        }

        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let Some(artifact) = remote.fetch(hash).await? else {
            return Ok(None);
        };
        self.fs.unpack_entry(hash, &artifact)?;
        Ok(self.fs.fetch(anchor, hash)?.map(|hit| CacheHit {
            metadata: CacheHitMetadata {
                source: CacheSource::Remote,
                ..hit.metadata
            },
            ..hit
        }))
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if let Some(meta) = self.fs.exists(hash)? {
            return Ok(Some(meta));
        }
        if let Some(remote) = &self.remote {
            if remote.exists(hash).await? {
                return Ok(Some(CacheHitMetadata {
                    source: CacheSource::Remote,
                    time_saved: 0,
                }));
            }
        }
        Ok(None)
    }

    pub fn outputs_match(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<bool, CacheError> {
        self.fs.outputs_match(anchor, hash)
    }

    pub fn terminal_output(&self, hash: &str) -> Result<Vec<u8>, CacheError> {
        self.fs.terminal_output(hash)
    }

    /// Stores locally, then mirrors to the remote tier. Remote failures are
    /// logged and swallowed: the run must not fail because a mirror did.
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        terminal_output: &[u8],
        exit_code: i32,
        duration_ms: u64,
    ) -> Result<(), CacheError> {
        self.fs
            .put(anchor, hash, files, terminal_output, exit_code, duration_ms)?;

        if let (Some(remote), false) = (&self.remote, self.remote_read_only) {
            match self.fs.pack_entry(hash) {
                Ok(artifact) => {
                    if let Err(err) = remote.put(hash, artifact).await {
                        warn!("unable to mirror {hash} to the remote cache: {err}");
                    }
                }
                Err(err) => warn!("unable to pack {hash} for the remote cache: {err}"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use nxpath::{AbsoluteSystemPathBuf, AnchoredSystemPath};
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct TestRemoteCache {
        store: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl RemoteCache for TestRemoteCache {
        async fn exists(&self, hash: &str) -> Result<bool, CacheError> {
            Ok(self.store.lock().await.contains_key(hash))
        }

        async fn fetch(&self, hash: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Ok(self.store.lock().await.get(hash).cloned())
        }

        async fn put(&self, hash: &str, artifact: Vec<u8>) -> Result<(), CacheError> {
            self.store.lock().await.insert(hash.to_string(), artifact);
            Ok(())
        }
    }

    fn workspace() -> (tempfile::TempDir, AbsoluteSystemPathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
        (dir, root)
    }

    fn cache_for(root: &AbsoluteSystemPath) -> FsCache {
        FsCache::new(root, AnchoredSystemPath::new(".nx/cache/tasks").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_remote_miss_falls_back_to_none() {
        let (_dir, root) = workspace();
        let multiplexer =
            CacheMultiplexer::new(cache_for(&root), Some(Arc::new(TestRemoteCache::default())), false);
        assert!(multiplexer.fetch(&root, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_mirrors_and_remote_backfills_local() {
        let (_dir, writer_root) = workspace();
        let out = AnchoredSystemPathBuf::from_raw("dist/out.txt").unwrap();
        let out_file = writer_root.resolve(&out);
        out_file.parent().unwrap().create_dir_all().unwrap();
        out_file.create_with_contents("shared").unwrap();

        let remote = Arc::new(TestRemoteCache::default());
        let writer =
            CacheMultiplexer::new(cache_for(&writer_root), Some(remote.clone()), false);
        writer
            .put(&writer_root, "abcd", &[out.clone()], b"log\n", 0, 3)
            .await
            .unwrap();
        assert!(remote.exists("abcd").await.unwrap());

        // A different workspace with an empty local cache hits via remote.
        let (_dir2, reader_root) = workspace();
        let reader = CacheMultiplexer::new(cache_for(&reader_root), Some(remote), false);
        let hit = reader
            .fetch(&reader_root, "abcd")
            .await
            .unwrap()
            .expect("remote hit");
        assert_eq!(hit.metadata.source, CacheSource::Remote);
        assert_eq!(
            reader_root.resolve(&out).read_to_string().unwrap(),
            "shared"
        );

        // Second fetch is now local.
        let hit = reader
            .fetch(&reader_root, "abcd")
            .await
            .unwrap()
            .expect("local hit");
        assert_eq!(hit.metadata.source, CacheSource::Local);
    }

    #[tokio::test]
    async fn test_read_only_remote_never_written() {
        let (_dir, root) = workspace();
        let out = AnchoredSystemPathBuf::from_raw("dist/out.txt").unwrap();
        let out_file = root.resolve(&out);
        out_file.parent().unwrap().create_dir_all().unwrap();
        out_file.create_with_contents("local only").unwrap();

        let remote = Arc::new(TestRemoteCache::default());
        let multiplexer = CacheMultiplexer::new(cache_for(&root), Some(remote.clone()), true);
        multiplexer
            .put(&root, "9999", &[out], b"", 0, 0)
            .await
            .unwrap();
        assert!(!remote.exists("9999").await.unwrap());
    }
}
