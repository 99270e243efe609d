//! The collection index: an append-only, newline-delimited record store.
//!
//! Each line is a self-contained JSON object `{id, CID, filename,
//! extension}`. Ids are assigned monotonically and never reused; deleting
//! a record leaves a gap. Entries are kept and persisted in insertion (=
//! id) order, and saves rewrite the whole file atomically — the live file
//! is never edited in place.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::util::{atomic_write, remove_stale_tmp};

pub const INDEX_FILE: &str = "collection.ndjson";

/// One line of the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: u64,
    #[serde(rename = "CID")]
    pub content_address: String,
    /// Basename, or a root-relative path when the basename would collide
    /// with another entry.
    pub filename: String,
    /// Lower-cased suffix after the final dot, without the dot.
    pub extension: String,
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum IndexError {
    #[error("index record not found: {0}")]
    NotFound(String),

    #[error("index already has a record named {0}")]
    Duplicate(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serializing index record failed: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// In-memory index plus its on-disk location.
#[derive(Debug)]
pub struct Index {
    path: PathBuf,
    entries: BTreeMap<u64, IndexEntry>,
    by_filename: HashMap<String, u64>,
    next_id: u64,
}

impl Index {
    /// Loads the index from `path`. Malformed lines are skipped with a
    /// warning; `next_id` becomes one past the highest id seen.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        remove_stale_tmp(&path);

        let mut index = Index {
            path,
            entries: BTreeMap::new(),
            by_filename: HashMap::new(),
            next_id: 1,
        };

        let text = match std::fs::read_to_string(&index.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no index file, starting empty");
                return Ok(index);
            }
            Err(err) => return Err(err.into()),
        };

        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: IndexEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(line = lineno + 1, %err, "skipping malformed index line");
                    continue;
                }
            };
            index.next_id = index.next_id.max(entry.id + 1);
            index.by_filename.insert(entry.filename.clone(), entry.id);
            index.entries.insert(entry.id, entry);
        }

        tracing::info!(
            records = index.entries.len(),
            next_id = index.next_id,
            "index loaded"
        );
        Ok(index)
    }

    /// Appends a new record under the next free id.
    pub fn add(
        &mut self,
        filename: impl Into<String>,
        content_address: impl Into<String>,
        extension: impl Into<String>,
    ) -> Result<IndexEntry, IndexError> {
        let filename = filename.into();
        if self.by_filename.contains_key(&filename) {
            return Err(IndexError::Duplicate(filename));
        }

        let entry = IndexEntry {
            id: self.next_id,
            content_address: content_address.into(),
            filename: filename.clone(),
            extension: extension.into(),
        };
        self.next_id += 1;
        self.by_filename.insert(filename, entry.id);
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    /// Replaces the content address of an existing record; id unchanged.
    pub fn update_address(
        &mut self,
        filename: &str,
        content_address: impl Into<String>,
    ) -> Result<IndexEntry, IndexError> {
        let id = self.id_for(filename)?;
        let entry = self.entries.get_mut(&id).expect("filename map in sync");
        entry.content_address = content_address.into();
        Ok(entry.clone())
    }

    /// Re-labels a record; id and content address unchanged.
    pub fn rename(&mut self, old_filename: &str, new_filename: impl Into<String>) -> Result<IndexEntry, IndexError> {
        let new_filename = new_filename.into();
        if self.by_filename.contains_key(&new_filename) {
            return Err(IndexError::Duplicate(new_filename));
        }
        let id = self.id_for(old_filename)?;
        self.by_filename.remove(old_filename);
        self.by_filename.insert(new_filename.clone(), id);
        let entry = self.entries.get_mut(&id).expect("filename map in sync");
        entry.filename = new_filename;
        Ok(entry.clone())
    }

    /// Deletes a record. Remaining ids keep their values; the gap stays.
    pub fn remove(&mut self, filename: &str) -> Result<IndexEntry, IndexError> {
        let id = self.id_for(filename)?;
        self.by_filename.remove(filename);
        Ok(self.entries.remove(&id).expect("filename map in sync"))
    }

    pub fn get(&self, filename: &str) -> Option<&IndexEntry> {
        self.by_filename.get(filename).and_then(|id| self.entries.get(id))
    }

    pub fn get_by_id(&self, id: u64) -> Option<&IndexEntry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.by_filename.contains_key(filename)
    }

    /// True when some record carries the given basename, under any name.
    pub fn has_basename(&self, basename: &str) -> bool {
        self.entries
            .values()
            .any(|e| e.filename == basename || e.filename.rsplit('/').next() == Some(basename))
    }

    pub fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the index file atomically, one JSON object per line, in id
    /// order.
    pub fn save(&self) -> Result<(), IndexError> {
        let mut out = Vec::new();
        for entry in self.entries.values() {
            let line = serde_json::to_vec(entry).map_err(IndexError::Serialize)?;
            out.extend_from_slice(&line);
            out.push(b'\n');
        }
        atomic_write(&self.path, &out).map_err(|e| IndexError::Io(std::io::Error::other(e)))?;
        tracing::debug!(records = self.entries.len(), "index saved");
        Ok(())
    }

    fn id_for(&self, filename: &str) -> Result<u64, IndexError> {
        self.by_filename
            .get(filename)
            .copied()
            .ok_or_else(|| IndexError::NotFound(filename.to_string()))
    }
}
