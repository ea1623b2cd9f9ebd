use std::{
    collections::BTreeMap,
    time::UNIX_EPOCH,
};

use nxpath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, RelativeUnixPath, RelativeUnixPathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{hash_bytes, Error};

/// Sentinel recorded for files that exist but cannot be read. Keeping the
/// record means the aggregate hash still changes when the file becomes
/// readable again.
pub const UNREADABLE_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const INDEX_VERSION: &str = "1";

/// Ignore file honored on top of `.gitignore` semantics.
const WORKSPACE_IGNORE_FILENAME: &str = ".nxignore";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: RelativeUnixPathBuf,
    pub hash: String,
    pub size: u64,
    /// Modification time in milliseconds since the epoch. Used only for
    /// change detection between runs, never hashed.
    pub mtime_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashWarning {
    pub path: RelativeUnixPathBuf,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedIndex {
    version: String,
    files: Vec<FileRecord>,
}

/// Hashes tracked workspace files and keeps an incremental index across runs.
#[derive(Debug)]
pub struct FileHasher {
    repo_root: AbsoluteSystemPathBuf,
    records: BTreeMap<RelativeUnixPathBuf, FileRecord>,
    warnings: Vec<HashWarning>,
}

impl FileHasher {
    pub fn new(repo_root: &AbsoluteSystemPath) -> Self {
        Self {
            repo_root: repo_root.to_owned(),
            records: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Enumerates tracked files and hashes each one. Ignore patterns follow
    /// `.gitignore` plus the workspace-level ignore file.
    pub fn init(&mut self) -> Result<(), Error> {
        self.records.clear();
        self.warnings.clear();

        let mut builder = ignore::WalkBuilder::new(self.repo_root.as_std_path());
        builder
            .hidden(false)
            .require_git(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .add_custom_ignore_filename(WORKSPACE_IGNORE_FILENAME)
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                name != ".git" && name != ".nx"
            });

        for entry in builder.build() {
            let entry = entry?;
            if !entry.file_type().map_or(false, |t| t.is_file()) {
                continue;
            }
            let path = AbsoluteSystemPath::from_std_path(entry.path())?;
            let anchored = self.repo_root.anchor(path)?;
            self.hash_one(anchored.to_unix())?;
        }
        debug!(
            "hashed {} files under {}",
            self.records.len(),
            self.repo_root
        );
        Ok(())
    }

    /// Rehashes only the supplied change-set. Paths that no longer exist are
    /// dropped from the index.
    pub fn rehash(&mut self, changed: &[RelativeUnixPathBuf]) -> Result<(), Error> {
        for path in changed {
            let absolute = self.repo_root.resolve(&path.to_system());
            if absolute.is_file() {
                self.hash_one(path.clone())?;
            } else {
                self.records.remove(path);
            }
        }
        Ok(())
    }

    fn hash_one(&mut self, path: RelativeUnixPathBuf) -> Result<(), Error> {
        let absolute = self.repo_root.resolve(&path.to_system());
        let (size, mtime_ms) = match absolute.metadata() {
            Ok(metadata) => (metadata.len(), mtime_millis(&metadata)),
            Err(_) => (0, 0),
        };
        let record = match absolute.read() {
            Ok(bytes) => FileRecord {
                path: path.clone(),
                hash: hash_bytes(bytes),
                size,
                mtime_ms,
            },
            Err(err) => {
                self.warnings.push(HashWarning {
                    path: path.clone(),
                    message: err.to_string(),
                });
                FileRecord {
                    path: path.clone(),
                    hash: UNREADABLE_HASH.to_string(),
                    size,
                    mtime_ms,
                }
            }
        };
        self.records.insert(path, record);
        Ok(())
    }

    /// Snapshot of every record, sorted by path.
    pub fn all_file_data(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    pub fn file_hash(&self, path: &RelativeUnixPath) -> Option<&str> {
        self.records.get(path).map(|record| record.hash.as_str())
    }

    pub fn contains(&self, path: &RelativeUnixPath) -> bool {
        self.records.contains_key(path)
    }

    /// Aggregate hash over a subset of paths: the hash of the canonical
    /// serialization `(path \0 contentHash \n)*` over the sorted set. Paths
    /// missing from the index contribute nothing.
    pub fn hash_files<'a, I>(&self, paths: I) -> String
    where
        I: IntoIterator<Item = &'a RelativeUnixPath>,
    {
        let mut entries: Vec<(&RelativeUnixPath, &str)> = paths
            .into_iter()
            .filter_map(|path| {
                self.records
                    .get(path)
                    .map(|record| (path, record.hash.as_str()))
            })
            .collect();
        entries.sort();
        entries.dedup();

        let mut buffer = Vec::new();
        for (path, hash) in entries {
            buffer.extend_from_slice(path.as_str().as_bytes());
            buffer.push(0);
            buffer.extend_from_slice(hash.as_bytes());
            buffer.push(b'\n');
        }
        hash_bytes(buffer)
    }

    /// Aggregate hash over the whole index.
    pub fn aggregate_hash(&self) -> String {
        self.hash_files(self.records.keys().map(|p| p.as_ref()))
    }

    /// Paths whose current record differs from `previous`, plus paths that
    /// only exist on one side. Used for affected computations.
    pub fn diff<'a>(&'a self, previous: &'a FileHasher) -> Vec<&'a RelativeUnixPath> {
        let mut changed = Vec::new();
        for (path, record) in &self.records {
            match previous.records.get(path) {
                Some(old) if old.hash == record.hash => {}
                _ => changed.push(path.as_ref()),
            }
        }
        for path in previous.records.keys() {
            if !self.records.contains_key(path) {
                changed.push(path.as_ref());
            }
        }
        changed.sort();
        changed
    }

    pub fn warnings(&self) -> &[HashWarning] {
        &self.warnings
    }

    pub fn load(repo_root: &AbsoluteSystemPath, index_path: &AbsoluteSystemPath) -> Result<Self, Error> {
        let contents = index_path.read_to_string()?;
        let index: PersistedIndex = serde_json::from_str(&contents)?;
        let mut hasher = Self::new(repo_root);
        if index.version == INDEX_VERSION {
            hasher.records = index
                .files
                .into_iter()
                .map(|record| (record.path.clone(), record))
                .collect();
        }
        Ok(hasher)
    }

    pub fn persist(&self, index_path: &AbsoluteSystemPath) -> Result<(), Error> {
        if let Some(parent) = index_path.parent() {
            parent.create_dir_all()?;
        }
        let index = PersistedIndex {
            version: INDEX_VERSION.to_string(),
            files: self.records.values().cloned().collect(),
        };
        let temp = index_path
            .parent()
            .unwrap_or(index_path)
            .join_component(&format!(".{}.{}.tmp", "file-hashes", std::process::id()));
        temp.create_with_contents(serde_json::to_string(&index)?)?;
        temp.rename(index_path)?;
        Ok(())
    }
}

fn mtime_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
