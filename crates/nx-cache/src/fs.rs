//! Filesystem tier of the task cache.

use nx_hash::hash_bytes;
use nxpath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf, RelativeUnixPathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{CacheError, CacheHit, CacheHitMetadata, CacheSource};

const TERMINAL_OUTPUT_FILE: &str = "terminal-output.log";
const OUTPUTS_DIR: &str = "outputs";
const MANIFEST_FILE: &str = "outputs.manifest.json";
const META_FILE: &str = "meta.json";

/// Declared outputs of a cached task run. `sizes` and `hashes` are aligned
/// with `paths` by index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputsManifest {
    pub paths: Vec<RelativeUnixPathBuf>,
    pub sizes: Vec<u64>,
    pub hashes: Vec<String>,
}

impl OutputsManifest {
    fn push(&mut self, path: RelativeUnixPathBuf, bytes: &[u8]) {
        self.paths.push(path);
        self.sizes.push(bytes.len() as u64);
        self.hashes.push(hash_bytes(bytes));
    }

    fn entries(&self) -> impl Iterator<Item = (&RelativeUnixPathBuf, &String)> {
        self.paths.iter().zip(self.hashes.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub status: String,
    pub exit_code: i32,
    pub created_at: String,
    /// Milliseconds the original run took.
    #[serde(default)]
    pub duration_ms: u64,
}

impl CacheMetadata {
    fn read(path: &AbsoluteSystemPath) -> Result<CacheMetadata, CacheError> {
        serde_json::from_str(&path.read_to_string()?).map_err(CacheError::InvalidMetadata)
    }
}

pub struct FsCache {
    cache_directory: AbsoluteSystemPathBuf,
}

impl FsCache {
    pub fn new(
        repo_root: &AbsoluteSystemPath,
        cache_dir: &nxpath::AnchoredSystemPath,
    ) -> Result<Self, CacheError> {
        let cache_directory = repo_root.resolve(cache_dir);
        cache_directory.create_dir_all()?;
        Ok(FsCache { cache_directory })
    }

    fn entry_dir(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory.join_component(hash)
    }

    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let entry = self.entry_dir(hash);
        if !entry.join_component(META_FILE).is_file() {
            return Ok(None);
        }
        let meta = CacheMetadata::read(&entry.join_component(META_FILE))?;
        Ok(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: meta.duration_ms,
        }))
    }

    /// Restores the entry's declared outputs into the workspace and returns
    /// the captured terminal output. Restored files are verified against the
    /// manifest; an inconsistent entry is reported as a miss so the caller
    /// falls through to recomputation.
    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<CacheHit>, CacheError> {
        let entry = self.entry_dir(hash);
        if !entry.join_component(META_FILE).is_file() {
            debug!("cache miss for {hash} in {}", self.cache_directory);
            return Ok(None);
        }

        let meta = CacheMetadata::read(&entry.join_component(META_FILE))?;
        let manifest: OutputsManifest =
            serde_json::from_str(&entry.join_component(MANIFEST_FILE).read_to_string()?)
                .map_err(CacheError::InvalidMetadata)?;

        let payload_root = entry.join_component(OUTPUTS_DIR);
        let mut restored_files = Vec::with_capacity(manifest.paths.len());
        for (path, expected_hash) in manifest.entries() {
            let anchored = path.to_system();
            let source = payload_root.resolve(&anchored);
            let bytes = match source.read() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("cache entry {hash} is missing {path}: {err}");
                    return Ok(None);
                }
            };
            if hash_bytes(&bytes) != *expected_hash {
                warn!("cache entry {hash} has inconsistent payload for {path}; ignoring entry");
                return Ok(None);
            }
            let destination = anchor.resolve(&anchored);
            if let Some(parent) = destination.parent() {
                parent.create_dir_all()?;
            }
            destination.create_with_contents(&bytes)?;
            restored_files.push(anchored);
        }

        let terminal_output = entry.join_component(TERMINAL_OUTPUT_FILE).read()?;

        Ok(Some(CacheHit {
            metadata: CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: meta.duration_ms,
            },
            restored_files,
            terminal_output,
        }))
    }

    /// Whether the entry's declared outputs already exist in the workspace
    /// with matching content. When they do, a hit can keep the existing
    /// files instead of restoring.
    pub fn outputs_match(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<bool, CacheError> {
        let entry = self.entry_dir(hash);
        let manifest_path = entry.join_component(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Ok(false);
        }
        let manifest: OutputsManifest = serde_json::from_str(&manifest_path.read_to_string()?)
            .map_err(CacheError::InvalidMetadata)?;
        for (path, expected_hash) in manifest.entries() {
            let on_disk = anchor.resolve(&path.to_system());
            match on_disk.read() {
                Ok(bytes) if hash_bytes(&bytes) == *expected_hash => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    pub fn terminal_output(&self, hash: &str) -> Result<Vec<u8>, CacheError> {
        Ok(self
            .entry_dir(hash)
            .join_component(TERMINAL_OUTPUT_FILE)
            .read()?)
    }

    /// Stores an entry. The entry is assembled under a temp directory and
    /// published with a rename; when another writer already published the
    /// same hash, this write is discarded.
    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        terminal_output: &[u8],
        exit_code: i32,
        duration_ms: u64,
    ) -> Result<(), CacheError> {
        let final_dir = self.entry_dir(hash);
        if final_dir.exists() {
            debug!("cache entry {hash} already exists; keeping the existing entry");
            return Ok(());
        }

        let temp_dir = self
            .cache_directory
            .join_component(&format!(".{hash}.{}.tmp", std::process::id()));
        if temp_dir.exists() {
            temp_dir.remove_dir_all()?;
        }
        temp_dir.create_dir_all()?;

        let result = self.fill_entry(&temp_dir, anchor, files, terminal_output, exit_code, duration_ms);
        if let Err(err) = result {
            temp_dir.remove_dir_all().ok();
            return Err(err);
        }

        match temp_dir.rename(&final_dir) {
            Ok(()) => Ok(()),
            Err(_) if final_dir.exists() => {
                // lost the race; the winner's entry is equivalent
                temp_dir.remove_dir_all().ok();
                Ok(())
            }
            Err(err) => {
                temp_dir.remove_dir_all().ok();
                Err(err.into())
            }
        }
    }

    fn fill_entry(
        &self,
        temp_dir: &AbsoluteSystemPath,
        anchor: &AbsoluteSystemPath,
        files: &[AnchoredSystemPathBuf],
        terminal_output: &[u8],
        exit_code: i32,
        duration_ms: u64,
    ) -> Result<(), CacheError> {
        let payload_root = temp_dir.join_component(OUTPUTS_DIR);
        payload_root.create_dir_all()?;

        let mut manifest = OutputsManifest::default();
        for file in files {
            let source = anchor.resolve(file);
            let bytes = source.read()?;
            let destination = payload_root.resolve(file);
            if let Some(parent) = destination.parent() {
                parent.create_dir_all()?;
            }
            destination.create_with_contents(&bytes)?;
            manifest.push(file.to_unix(), &bytes);
        }

        temp_dir.join_component(MANIFEST_FILE).create_with_contents(
            serde_json::to_string_pretty(&manifest).map_err(CacheError::MetadataWriteFailure)?,
        )?;

        let meta = CacheMetadata {
            status: "success".to_string(),
            exit_code,
            created_at: chrono::Utc::now().to_rfc3339(),
            duration_ms,
        };
        temp_dir.join_component(META_FILE).create_with_contents(
            serde_json::to_string_pretty(&meta).map_err(CacheError::MetadataWriteFailure)?,
        )?;

        temp_dir
            .join_component(TERMINAL_OUTPUT_FILE)
            .create_with_contents(terminal_output)?;

        Ok(())
    }

    /// Packs an entry into the artifact form used by the remote tier.
    pub fn pack_entry(&self, hash: &str) -> Result<Vec<u8>, CacheError> {
        let entry = self.entry_dir(hash);
        if !entry.is_dir() {
            return Err(CacheError::MalformedArtifact(hash.to_string()));
        }
        let encoder = zstd::stream::write::Encoder::new(Vec::new(), 0)?;
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", entry.as_std_path())?;
        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    }

    /// Unpacks a remote artifact into the local store, making it a normal
    /// local entry from then on.
    pub fn unpack_entry(&self, hash: &str, artifact: &[u8]) -> Result<(), CacheError> {
        let final_dir = self.entry_dir(hash);
        if final_dir.exists() {
            return Ok(());
        }
        let temp_dir = self
            .cache_directory
            .join_component(&format!(".{hash}.{}.unpack.tmp", std::process::id()));
        if temp_dir.exists() {
            temp_dir.remove_dir_all()?;
        }
        temp_dir.create_dir_all()?;

        let decoder = zstd::stream::read::Decoder::new(artifact)?;
        let mut archive = tar::Archive::new(decoder);
        if archive.unpack(temp_dir.as_std_path()).is_err() {
            temp_dir.remove_dir_all().ok();
            return Err(CacheError::MalformedArtifact(hash.to_string()));
        }

        match temp_dir.rename(&final_dir) {
            Ok(()) => Ok(()),
            Err(_) if final_dir.exists() => {
                temp_dir.remove_dir_all().ok();
                Ok(())
            }
            Err(err) => {
                temp_dir.remove_dir_all().ok();
                Err(err.into())
            }
        }
    }
}
