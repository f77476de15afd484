//! Finding shard directories under a base path

use super::index::ShardIndex;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// A discovered shard: its directory and the name it is reported under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ShardHandle {
    /// Final component of the shard directory
    pub id: String,
    pub path: PathBuf,
}

impl ShardHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { id, path }
    }
}

/// Enumerates shards under one base directory.
#[derive(Debug, Clone)]
pub struct ShardDiscovery {
    base: PathBuf,
}

impl ShardDiscovery {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Child directories holding both shard artifacts, sorted by name, followed
    /// by the base directory itself if it holds them too.
    ///
    /// A missing or unreadable base yields no shards.
    pub fn discover(&self) -> Vec<ShardHandle> {
        let mut shards = Vec::new();

        match std::fs::read_dir(&self.base) {
            Ok(entries) => {
                let mut children: Vec<PathBuf> = entries
                    .filter_map(|entry| match entry {
                        Ok(entry) => Some(entry.path()),
                        Err(e) => {
                            tracing::warn!(
                                "Skipping unreadable entry in {}: {}",
                                self.base.display(),
                                e
                            );
                            None
                        }
                    })
                    .filter(|path| path.is_dir() && ShardIndex::has_artifacts(path))
                    .collect();
                children.sort();
                shards.extend(children.into_iter().map(ShardHandle::new));
            }
            Err(e) => {
                tracing::warn!("Cannot read shard base {}: {}", self.base.display(), e);
                return shards;
            }
        }

        if ShardIndex::has_artifacts(&self.base) {
            shards.push(ShardHandle::new(&self.base));
        }

        tracing::info!(
            "Discovered {} shard(s) under {}",
            shards.len(),
            self.base.display()
        );
        shards
    }
}
