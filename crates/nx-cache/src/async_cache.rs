//! Write-behind wrapper around the cache.
//!
//! Stores are expensive (payload copies plus an optional remote mirror), so
//! they run on a small worker pool while the runner moves on to the next
//! task. Reads stay synchronous with the caller.

use std::sync::Arc;

use nxpath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;

use crate::{CacheError, CacheHit, CacheHitMetadata, CacheMultiplexer};

struct WriteRequest {
    anchor: AbsoluteSystemPathBuf,
    hash: String,
    files: Vec<AnchoredSystemPathBuf>,
    terminal_output: Vec<u8>,
    exit_code: i32,
    duration_ms: u64,
}

pub struct AsyncCache {
    cache: Arc<CacheMultiplexer>,
    writer_sender: mpsc::Sender<WriteRequest>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncCache {
    pub fn new(cache: CacheMultiplexer, worker_count: usize) -> Self {
        let cache = Arc::new(cache);
        let worker_count = worker_count.max(1);
        let (writer_sender, receiver) = mpsc::channel::<WriteRequest>(worker_count * 2);

        // The receiver is shared: whichever worker is idle picks up the next
        // request.
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..worker_count)
            .map(|_| {
                let receiver = receiver.clone();
                let cache = cache.clone();
                tokio::spawn(async move {
                    loop {
                        let request = { receiver.lock().await.recv().await };
                        let Some(request) = request else {
                            break;
                        };
                        if let Err(err) = cache
                            .put(
                                &request.anchor,
                                &request.hash,
                                &request.files,
                                &request.terminal_output,
                                request.exit_code,
                                request.duration_ms,
                            )
                            .await
                        {
                            // A failed store is a lost optimization, not a
                            // failed task. The next run just misses.
                            warn!("unable to store {} in the cache: {err}", request.hash);
                        }
                    }
                })
            })
            .collect();

        Self {
            cache,
            writer_sender,
            workers,
        }
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<CacheHit>, CacheError> {
        self.cache.fetch(anchor, hash).await
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        self.cache.exists(hash).await
    }

    pub fn outputs_match(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<bool, CacheError> {
        self.cache.outputs_match(anchor, hash)
    }

    pub fn terminal_output(&self, hash: &str) -> Result<Vec<u8>, CacheError> {
        self.cache.terminal_output(hash)
    }

    /// Queues a store. Returns once the request is accepted, not once it has
    /// been written.
    pub async fn put(
        &self,
        anchor: AbsoluteSystemPathBuf,
        hash: String,
        files: Vec<AnchoredSystemPathBuf>,
        terminal_output: Vec<u8>,
        exit_code: i32,
        duration_ms: u64,
    ) -> Result<(), CacheError> {
        self.writer_sender
            .send(WriteRequest {
                anchor,
                hash,
                files,
                terminal_output,
                exit_code,
                duration_ms,
            })
            .await
            .map_err(|_| CacheError::CacheShuttingDown)
    }

    /// Drains pending writes and stops the workers.
    pub async fn shutdown(self) {
        let Self {
            writer_sender,
            workers,
            ..
        } = self;
        drop(writer_sender);
        for worker in workers {
            if worker.await.is_err() {
                warn!("cache worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use nxpath::AnchoredSystemPath;

    use super::*;
    use crate::FsCache;

    #[tokio::test]
    async fn test_put_is_visible_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
        let out = AnchoredSystemPathBuf::from_raw("dist/out.txt").unwrap();
        let out_file = root.resolve(&out);
        out_file.parent().unwrap().create_dir_all().unwrap();
        out_file.create_with_contents("payload").unwrap();

        let fs = FsCache::new(&root, AnchoredSystemPath::new(".nx/cache/tasks").unwrap()).unwrap();
        let cache = AsyncCache::new(CacheMultiplexer::new(fs, None, false), 2);
        cache
            .put(root.clone(), "1234".into(), vec![out], b"out\n".to_vec(), 0, 5)
            .await
            .unwrap();

        let multiplexer = cache.cache.clone();
        cache.shutdown().await;

        let hit = multiplexer
            .fetch(&root, "1234")
            .await
            .unwrap()
            .expect("entry written before shutdown completed");
        assert_eq!(hit.terminal_output, b"out\n");
    }
}
