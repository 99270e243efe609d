//! Persistent daemon state.
//!
//! A single JSON document, read once at startup and held in memory behind
//! the shared lock thereafter. Saves are atomic (temp file + rename), so
//! the on-disk copy is always either fully valid or exactly the previous
//! successful save. A parse failure at load is fatal: the operator must
//! intervene rather than have the daemon silently forget what it already
//! published.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::util::{atomic_write, remove_stale_tmp};

pub const STATE_FILE: &str = "state.json";

/// Per-file record, keyed in [`PersistentState::files`] by absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(rename = "cid")]
    pub content_address: String,
    #[serde(rename = "mtime")]
    pub mtime: i64,
    pub size: u64,
    /// Stable index record number; never changes while the record exists.
    #[serde(rename = "indexId")]
    pub index_id: u64,
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    /// Count of completed republish sequences. Only ever increases.
    pub version: u64,
    /// The mutable name handle the index is published under.
    #[serde(default)]
    pub ipns: String,
    /// Content address of the most recently uploaded index.
    #[serde(rename = "lastIndexCID", default)]
    pub last_index_address: String,
    /// Unix seconds of the last republish that changed the collection.
    /// Preserved across upgrades from state files that predate the field.
    #[serde(rename = "lastChangeTimestamp", default)]
    pub last_change_timestamp: i64,
    #[serde(default)]
    pub files: HashMap<String, FileRecord>,
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum StateError {
    /// The state file exists but does not parse. No silent reset.
    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serializing state failed: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Owns the in-memory state and its path; tracks whether the memory copy
/// has diverged from disk so the periodic flush can skip clean cycles.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: PersistentState,
    dirty: bool,
}

impl StateStore {
    /// Loads state from `path`. An absent file yields empty state at
    /// version 0; a stale `.tmp` sibling from a crashed save is deleted.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        remove_stale_tmp(&path);

        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StateError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no state file, starting fresh");
                PersistentState::default()
            }
            Err(err) => return Err(err.into()),
        };

        tracing::info!(
            version = state.version,
            files = state.files.len(),
            "state loaded"
        );
        Ok(StateStore {
            path,
            state,
            dirty: false,
        })
    }

    /// Writes the current state to disk atomically and clears the dirty
    /// flag.
    pub fn save(&mut self) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(&self.state).map_err(StateError::Serialize)?;
        atomic_write(&self.path, &bytes).map_err(|e| {
            StateError::Io(std::io::Error::other(e))
        })?;
        self.dirty = false;
        tracing::debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    pub fn get(&self) -> &PersistentState {
        &self.state
    }

    /// Mutable access; marks the store dirty.
    pub fn get_mut(&mut self) -> &mut PersistentState {
        self.dirty = true;
        &mut self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> FileRecord {
        FileRecord {
            content_address: "bafyaaa".to_string(),
            mtime: 1_700_000_000,
            size: 100,
            index_id: 1,
        }
    }

    #[test]
    fn absent_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load(dir.path().join(STATE_FILE)).unwrap();
        assert_eq!(store.get().version, 0);
        assert!(store.get().files.is_empty());
        assert!(!store.is_dirty());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);

        let mut store = StateStore::load(&path).unwrap();
        {
            let state = store.get_mut();
            state.version = 3;
            state.ipns = "k51abc".to_string();
            state.last_index_address = "bafyindex".to_string();
            state.last_change_timestamp = 1_700_000_050;
            state.files.insert("/m/a.mp3".to_string(), sample_record());
        }
        assert!(store.is_dirty());
        store.save().unwrap();
        assert!(!store.is_dirty());

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(reloaded.get().version, 3);
        assert_eq!(reloaded.get().ipns, "k51abc");
        assert_eq!(reloaded.get().last_change_timestamp, 1_700_000_050);
        assert_eq!(reloaded.get().files["/m/a.mp3"], sample_record());
    }

    #[test]
    fn corrupt_file_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);
        std::fs::write(&path, b"{ definitely not json").unwrap();

        let err = StateStore::load(&path).unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[test]
    fn stale_tmp_is_cleaned_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);
        let tmp = dir.path().join(format!("{STATE_FILE}.tmp"));
        std::fs::write(&tmp, b"partial write").unwrap();

        StateStore::load(&path).unwrap();
        assert!(!tmp.exists());
    }

    #[test]
    fn wire_field_names_match_the_original_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);

        let mut store = StateStore::load(&path).unwrap();
        store.get_mut().files.insert("/m/a.mp3".to_string(), sample_record());
        store.save().unwrap();

        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(json.get("lastIndexCID").is_some());
        assert!(json.get("lastChangeTimestamp").is_some());
        let record = &json["files"]["/m/a.mp3"];
        assert!(record.get("cid").is_some());
        assert!(record.get("indexId").is_some());
    }

    #[test]
    fn legacy_state_without_timestamp_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);
        std::fs::write(
            &path,
            br#"{"version":5,"ipns":"k51x","lastIndexCID":"bafy","files":{}}"#,
        )
        .unwrap();

        let store = StateStore::load(&path).unwrap();
        assert_eq!(store.get().version, 5);
        assert_eq!(store.get().last_change_timestamp, 0);
    }
}
