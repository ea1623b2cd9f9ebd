//! Per-run cache wiring: decides per task whether the cache is consulted,
//! what counts as that task's outputs, and which hit status applies.

use std::sync::Arc;

use nx_cache::{AsyncCache, CacheError, CacheSource};
use nxpath::{
    AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf, RelativeUnixPath,
    RelativeUnixPathBuf,
};
use tracing::debug;

use crate::{engine::TaskDefinition, lifecycle::TaskResultStatus, task_id::TaskId};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunCacheOpts {
    pub reads_disabled: bool,
    pub writes_disabled: bool,
}

pub struct RunCache {
    cache: AsyncCache,
    repo_root: AbsoluteSystemPathBuf,
    opts: RunCacheOpts,
}

impl RunCache {
    pub fn new(cache: AsyncCache, repo_root: &AbsoluteSystemPath, opts: RunCacheOpts) -> Self {
        Self {
            cache,
            repo_root: repo_root.to_owned(),
            opts,
        }
    }

    pub fn task_cache(
        self: &Arc<Self>,
        task_id: &TaskId,
        definition: &TaskDefinition,
        project_root: &RelativeUnixPath,
        hash: &str,
    ) -> TaskCache {
        TaskCache {
            run_cache: self.clone(),
            task_id: task_id.clone(),
            project_root: project_root.to_owned(),
            outputs: definition.outputs.clone(),
            caching_disabled: !definition.cache,
            hash: hash.to_string(),
        }
    }

    /// Drains pending cache writes. Must run before the process exits or
    /// stores queued by the last tasks may be lost.
    pub async fn shutdown(self) {
        self.cache.shutdown().await;
    }
}

#[derive(Debug)]
pub enum CacheRestoreOutcome {
    Miss,
    Hit {
        status: TaskResultStatus,
        terminal_output: Vec<u8>,
    },
}

pub struct TaskCache {
    run_cache: Arc<RunCache>,
    task_id: TaskId,
    project_root: RelativeUnixPathBuf,
    outputs: Vec<String>,
    caching_disabled: bool,
    hash: String,
}

impl TaskCache {
    /// Consults the cache for this task's hash. When the declared outputs
    /// already sit on disk with the right content, the hit keeps them in
    /// place instead of restoring.
    pub async fn restore(&self) -> Result<CacheRestoreOutcome, CacheError> {
        if self.caching_disabled || self.run_cache.opts.reads_disabled {
            return Ok(CacheRestoreOutcome::Miss);
        }

        let repo_root: &AbsoluteSystemPath = &self.run_cache.repo_root;
        if self.run_cache.cache.outputs_match(repo_root, &self.hash)? {
            debug!("{}: outputs already on disk for {}", self.task_id, self.hash);
            return Ok(CacheRestoreOutcome::Hit {
                status: TaskResultStatus::LocalCacheKeptExisting,
                terminal_output: self.run_cache.cache.terminal_output(&self.hash)?,
            });
        }

        match self.run_cache.cache.fetch(repo_root, &self.hash).await? {
            Some(hit) => Ok(CacheRestoreOutcome::Hit {
                status: match hit.metadata.source {
                    CacheSource::Local => TaskResultStatus::LocalCache,
                    CacheSource::Remote => TaskResultStatus::RemoteCache,
                },
                terminal_output: hit.terminal_output,
            }),
            None => Ok(CacheRestoreOutcome::Miss),
        }
    }

    /// Stores the task's declared outputs and captured terminal stream.
    /// Only called for successful runs; uncacheable tasks are a no-op.
    pub async fn store(
        &self,
        terminal_output: Vec<u8>,
        exit_code: i32,
        duration_ms: u64,
    ) -> Result<(), CacheError> {
        if self.caching_disabled || self.run_cache.opts.writes_disabled {
            return Ok(());
        }
        let files = self.expand_outputs()?;
        self.run_cache
            .cache
            .put(
                self.run_cache.repo_root.clone(),
                self.hash.clone(),
                files,
                terminal_output,
                exit_code,
                duration_ms,
            )
            .await
    }

    /// Expands declared output globs into concrete workspace-relative
    /// files. Output declarations are project-root relative unless they
    /// carry a `{workspaceRoot}/` prefix; gitignore does not apply here
    /// since build outputs are routinely ignored.
    fn expand_outputs(&self) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut project_globs = Vec::new();
        let mut workspace_globs = Vec::new();
        for output in &self.outputs {
            if let Some(glob) = output.strip_prefix("{workspaceRoot}/") {
                workspace_globs.push(normalize_output_glob(glob));
            } else {
                let glob = output.strip_prefix("{projectRoot}/").unwrap_or(output);
                project_globs.push(normalize_output_glob(glob));
            }
        }

        let mut files = Vec::new();
        if let Some(matcher) = build_matcher(&project_globs)? {
            let project_dir = self
                .run_cache
                .repo_root
                .resolve(&self.project_root.to_system());
            let mut project_files = Vec::new();
            collect_files(&project_dir, &mut project_files)?;
            for file in project_files {
                let relative = project_dir
                    .anchor(&file)
                    .expect("collected files live under the project dir");
                if matcher.is_match(relative.as_str()) {
                    files.push(
                        self.run_cache
                            .repo_root
                            .anchor(&file)
                            .expect("project dir lives under the workspace"),
                    );
                }
            }
        }
        if let Some(matcher) = build_matcher(&workspace_globs)? {
            let mut workspace_files = Vec::new();
            collect_files(&self.run_cache.repo_root, &mut workspace_files)?;
            for file in workspace_files {
                let relative = self
                    .run_cache
                    .repo_root
                    .anchor(&file)
                    .expect("collected files live under the workspace");
                if matcher.is_match(relative.as_str()) {
                    files.push(relative);
                }
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }
}

/// A declared output may be a directory; match everything under it too.
fn normalize_output_glob(glob: &str) -> String {
    if glob.contains('*') {
        glob.to_string()
    } else {
        format!("{{{glob},{glob}/**}}")
    }
}

fn build_matcher(globs: &[String]) -> Result<Option<globset::GlobSet>, CacheError> {
    if globs.is_empty() {
        return Ok(None);
    }
    let mut builder = globset::GlobSetBuilder::new();
    for glob in globs {
        builder.add(globset::Glob::new(glob).map_err(|err| {
            CacheError::IO(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid output glob {glob}: {err}"),
            ))
        })?);
    }
    builder
        .build()
        .map(Some)
        .map_err(|err| CacheError::IO(std::io::Error::new(std::io::ErrorKind::InvalidInput, err)))
}

fn collect_files(
    dir: &AbsoluteSystemPath,
    out: &mut Vec<AbsoluteSystemPathBuf>,
) -> Result<(), CacheError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in dir.read_dir()? {
        let entry = entry?;
        let path = AbsoluteSystemPathBuf::from_std_path(entry.path())
            .map_err(|err| CacheError::IO(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if path.file_name() != Some(".nx") && path.file_name() != Some(".git") {
                collect_files(&path, out)?;
            }
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use nx_cache::{CacheMultiplexer, FsCache};
    use nxpath::AnchoredSystemPath;

    use super::*;

    fn fixture() -> (tempfile::TempDir, AbsoluteSystemPathBuf, Arc<RunCache>) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::from_std_path(dir.path()).unwrap();
        let fs = FsCache::new(&root, AnchoredSystemPath::new(".nx/cache/tasks").unwrap()).unwrap();
        let cache = AsyncCache::new(CacheMultiplexer::new(fs, None, false), 1);
        let run_cache = Arc::new(RunCache::new(cache, &root, RunCacheOpts::default()));
        (dir, root, run_cache)
    }

    fn cacheable_definition() -> TaskDefinition {
        TaskDefinition {
            cache: true,
            outputs: vec!["dist".to_string()],
            ..Default::default()
        }
    }

    fn run_cache_for(root: &AbsoluteSystemPath) -> Arc<RunCache> {
        let fs = FsCache::new(root, AnchoredSystemPath::new(".nx/cache/tasks").unwrap()).unwrap();
        let cache = AsyncCache::new(CacheMultiplexer::new(fs, None, false), 1);
        Arc::new(RunCache::new(cache, root, RunCacheOpts::default()))
    }

    #[tokio::test]
    async fn test_store_then_restore_round_trip() {
        let (_dir, root, run_cache) = fixture();
        let project_root = RelativeUnixPathBuf::new("packages/a").unwrap();
        let out_path = RelativeUnixPathBuf::new("packages/a/dist/main.js").unwrap();
        let out_file = root.resolve(&out_path.to_system());
        out_file.parent().unwrap().create_dir_all().unwrap();
        out_file.create_with_contents("built").unwrap();

        let definition = cacheable_definition();
        let task_cache = run_cache.task_cache(
            &TaskId::new("a", "build"),
            &definition,
            &project_root,
            "feedface",
        );

        assert!(matches!(
            task_cache.restore().await.unwrap(),
            CacheRestoreOutcome::Miss
        ));
        task_cache
            .store(b"compiled ok\n".to_vec(), 0, 40)
            .await
            .unwrap();
        // write-behind: drain the workers so the entry is on disk
        drop(task_cache);
        Arc::try_unwrap(run_cache)
            .map_err(|_| "run cache still shared")
            .unwrap()
            .shutdown()
            .await;

        // outputs still on disk and matching: kept-existing
        let run_cache = run_cache_for(&root);
        let task_cache = run_cache.task_cache(
            &TaskId::new("a", "build"),
            &definition,
            &project_root,
            "feedface",
        );
        match task_cache.restore().await.unwrap() {
            CacheRestoreOutcome::Hit {
                status,
                terminal_output,
            } => {
                assert_eq!(status, TaskResultStatus::LocalCacheKeptExisting);
                assert_eq!(terminal_output, b"compiled ok\n");
            }
            other => panic!("expected hit, got {other:?}"),
        }

        // outputs deleted: the hit restores them byte-for-byte
        root.resolve(&out_path.to_system()).remove_file().unwrap();
        match task_cache.restore().await.unwrap() {
            CacheRestoreOutcome::Hit { status, .. } => {
                assert_eq!(status, TaskResultStatus::LocalCache)
            }
            other => panic!("expected hit, got {other:?}"),
        }
        assert_eq!(
            root.resolve(&out_path.to_system()).read_to_string().unwrap(),
            "built"
        );
    }

    #[tokio::test]
    async fn test_uncacheable_tasks_never_hit() {
        let (_dir, _root, run_cache) = fixture();
        let definition = TaskDefinition {
            cache: false,
            ..Default::default()
        };
        let task_cache = run_cache.task_cache(
            &TaskId::new("a", "dev"),
            &definition,
            RelativeUnixPath::new("packages/a").unwrap(),
            "c0ffee",
        );
        task_cache.store(b"ignored".to_vec(), 0, 1).await.unwrap();
        assert!(matches!(
            task_cache.restore().await.unwrap(),
            CacheRestoreOutcome::Miss
        ));
    }
}
