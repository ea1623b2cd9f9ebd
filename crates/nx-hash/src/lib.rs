//! Content hashing for workspace files and canonical hash buffers.
//!
//! Everything here is deterministic across hosts: hashes are computed over
//! file bytes and canonical serializations only. Wall-clock, hostname, PID,
//! and iteration order never reach a hasher.

mod file_hasher;

pub use file_hasher::{FileHasher, FileRecord, HashWarning, UNREADABLE_HASH};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
    #[error("invalid path: {0}")]
    Path(#[from] nxpath::PathError),
    #[error("walk error: {0}")]
    Walk(#[from] ignore::Error),
    #[error("unable to read hash index: {0}")]
    Index(#[from] serde_json::Error),
}

/// SHA-256 of raw bytes, hex encoded.
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Builds a hash from labeled sections.
///
/// Each section is written as `label \0 len(value) value`, which makes the
/// encoding prefix-free: two different section lists can never produce the
/// same byte stream. Callers are responsible for feeding values in a
/// canonical order (sorted keys, sorted paths).
pub struct ContentHasher {
    hasher: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn put_section(&mut self, label: &str, value: impl AsRef<[u8]>) -> &mut Self {
        let value = value.as_ref();
        self.hasher.update(label.as_bytes());
        self.hasher.update([0u8]);
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value);
        self
    }

    /// Writes one section per value under the same label.
    pub fn put_section_values<I, S>(&mut self, label: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        for value in values {
            self.put_section(label, value);
        }
        self
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bytes_stable() {
        assert_eq!(hash_bytes("hello"), hash_bytes("hello"));
        assert_ne!(hash_bytes("hello"), hash_bytes("hello!"));
    }

    #[test]
    fn test_sections_are_prefix_free() {
        let mut a = ContentHasher::new();
        a.put_section("files", "ab");
        let mut b = ContentHasher::new();
        b.put_section("files", "a").put_section("files", "b");
        assert_ne!(a.finish(), b.finish());

        let mut c = ContentHasher::new();
        c.put_section("file", "sab");
        let mut d = ContentHasher::new();
        d.put_section("files", "ab");
        assert_ne!(c.finish(), d.finish());
    }

    #[test]
    fn test_section_order_matters() {
        let mut a = ContentHasher::new();
        a.put_section("x", "1").put_section("y", "2");
        let mut b = ContentHasher::new();
        b.put_section("y", "2").put_section("x", "1");
        assert_ne!(a.finish(), b.finish());
    }
}
