// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent store for parsed feed items.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CacheError;
use crate::feed::FeedItem;

/// Receives completed items and can forget all of them
pub trait FeedCache: Send + Sync {
    fn store(&self, item: &FeedItem) -> Result<(), CacheError>;

    /// Remove every cached item, returning how many were removed
    fn clear(&self) -> Result<usize, CacheError>;
}

/// Cache that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl FeedCache for NoopCache {
    fn store(&self, _item: &FeedItem) -> Result<(), CacheError> {
        Ok(())
    }

    fn clear(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    cached_at: String,
    item: FeedItem,
}

/// One JSON file per item, named after a hash of the item link.
///
/// Storing an item with the same link again replaces the earlier entry.
#[derive(Debug, Clone)]
pub struct JsonDirCache {
    dir: PathBuf,
}

impl JsonDirCache {
    /// Use `dir` as cache directory, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| CacheError::CreateDirectoryFailed {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every cached item, newest publication date first
    pub fn load_all(&self) -> Result<Vec<FeedItem>, CacheError> {
        let mut items = Vec::new();
        for path in self.entry_paths()? {
            let content = std::fs::read_to_string(&path).map_err(|e| CacheError::ReadFailed {
                path: path.clone(),
                source: e,
            })?;
            let entry: CacheEntry = serde_json::from_str(&content)
                .map_err(|e| CacheError::JsonParseFailed { path, source: e })?;
            items.push(entry.item);
        }

        items.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then_with(|| a.link.cmp(&b.link)));
        Ok(items)
    }

    fn path_for(&self, item: &FeedItem) -> PathBuf {
        let digest = Sha256::digest(item.link.as_str().as_bytes());
        self.dir.join(format!("{digest:x}.json"))
    }

    fn entry_paths(&self) -> Result<Vec<PathBuf>, CacheError> {
        let read_dir_failed = |e| CacheError::ReadDirectoryFailed {
            path: self.dir.clone(),
            source: e,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(read_dir_failed)? {
            let path = entry.map_err(read_dir_failed)?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

impl FeedCache for JsonDirCache {
    fn store(&self, item: &FeedItem) -> Result<(), CacheError> {
        let entry = CacheEntry {
            cached_at: Utc::now().to_rfc3339(),
            item: item.clone(),
        };
        let json = serde_json::to_string_pretty(&entry)?;

        let path = self.path_for(item);
        std::fs::write(&path, json).map_err(|e| CacheError::WriteFailed { path, source: e })
    }

    fn clear(&self) -> Result<usize, CacheError> {
        let paths = self.entry_paths()?;
        let count = paths.len();
        for path in paths {
            std::fs::remove_file(&path).map_err(|e| CacheError::RemoveFailed { path, source: e })?;
        }
        tracing::debug!(dir = %self.dir.display(), removed = count, "cache cleared");
        Ok(count)
    }
}
