//! A staged virtual file tree.
//!
//! Generators operate against this tree: reads see staged content first,
//! writes and deletes stay in memory, and nothing touches the real
//! filesystem until `commit`. Committing applies every change atomically
//! (temp file + rename per write) and invalidates the persisted project
//! graph, since any workspace mutation can change it.

use std::collections::BTreeMap;

use nxpath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, RelativeUnixPath, RelativeUnixPathBuf};

use crate::project_graph::ProjectGraphCache;

#[derive(Debug, Clone, PartialEq)]
enum Change {
    Write(Vec<u8>),
    Delete,
}

pub struct FsTree {
    root: AbsoluteSystemPathBuf,
    changes: BTreeMap<RelativeUnixPathBuf, Change>,
}

impl FsTree {
    pub fn new(root: &AbsoluteSystemPath) -> Self {
        Self {
            root: root.to_owned(),
            changes: BTreeMap::new(),
        }
    }

    fn on_disk(&self, path: &RelativeUnixPath) -> AbsoluteSystemPathBuf {
        self.root.resolve(&path.to_system())
    }

    pub fn read(&self, path: &RelativeUnixPath) -> Option<Vec<u8>> {
        match self.changes.get(path) {
            Some(Change::Write(contents)) => Some(contents.clone()),
            Some(Change::Delete) => None,
            None => self.on_disk(path).read().ok(),
        }
    }

    pub fn read_to_string(&self, path: &RelativeUnixPath) -> Option<String> {
        String::from_utf8(self.read(path)?).ok()
    }

    pub fn exists(&self, path: &RelativeUnixPath) -> bool {
        match self.changes.get(path) {
            Some(Change::Write(_)) => true,
            Some(Change::Delete) => false,
            None => self.on_disk(path).exists(),
        }
    }

    pub fn write(&mut self, path: &RelativeUnixPath, contents: impl Into<Vec<u8>>) {
        self.changes
            .insert(path.to_owned(), Change::Write(contents.into()));
    }

    pub fn delete(&mut self, path: &RelativeUnixPath) {
        self.changes.insert(path.to_owned(), Change::Delete);
    }

    /// Direct children of a directory, merging staged and on-disk entries.
    pub fn children(&self, dir: &RelativeUnixPath) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let disk_dir = self.on_disk(dir);
        if let Ok(entries) = disk_dir.read_dir() {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        let prefix = if dir.as_str().is_empty() {
            String::new()
        } else {
            format!("{}/", dir.as_str())
        };
        for (path, change) in &self.changes {
            let Some(rest) = path.as_str().strip_prefix(&prefix) else {
                continue;
            };
            let name = rest.split('/').next().unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            match change {
                Change::Write(_) => names.push(name.to_string()),
                Change::Delete if rest == name => {
                    names.retain(|existing| existing != name);
                }
                Change::Delete => {}
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// Applies all staged changes and invalidates the project graph cache.
    /// Returns the changed paths.
    pub fn commit(self) -> std::io::Result<Vec<RelativeUnixPathBuf>> {
        let mut changed = Vec::with_capacity(self.changes.len());
        for (path, change) in &self.changes {
            let destination = self.on_disk(path);
            match change {
                Change::Write(contents) => {
                    if let Some(parent) = destination.parent() {
                        parent.create_dir_all()?;
                    }
                    let temp = destination
                        .parent()
                        .expect("workspace files have parents")
                        .join_component(&format!(
                            ".{}.{}.tmp",
                            destination.file_name().unwrap_or("staged"),
                            std::process::id()
                        ));
                    temp.create_with_contents(contents)?;
                    temp.rename(&destination)?;
                }
                Change::Delete => match destination.remove_file() {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                },
            }
            changed.push(path.clone());
        }

        if !changed.is_empty() {
            ProjectGraphCache::new(&self.root).invalidate()?;
        }
        Ok(changed)
    }
}
