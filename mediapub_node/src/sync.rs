//! The sync engine: the state machine that keeps the filesystem, the
//! index, the persistent state and the published name in agreement.
//!
//! The engine is the *only* writer of state and index. It consumes the
//! startup scan once and watcher events continuously, uploads changed
//! content, mutates the index, and runs the republish sequence after every
//! mutation batch. Everything shared with the announcer and the flush
//! timer lives behind a single reader/writer lock; the engine takes the
//! write side, everyone else reads.
//!
//! Upload failures are classified, not retried inline: transient network
//! failures park the path in a retry queue with a fixed backoff, while
//! vanished files are abandoned cleanly (their delete event settles the
//! state shortly after).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mediapub_core::{AddOptions, NamePublishOptions, NetClient, NetError};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::filter::FileFilter;
use crate::index::Index;
use crate::scanner::Scanner;
use crate::state::{FileRecord, StateStore};
use crate::util::now_unix;
use crate::watcher::{FileEvent, FileEventKind};

/// Backoff between attempts for transiently failed work.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// The structures guarded by the single reader/writer lock.
#[derive(Debug)]
pub struct Shared {
    pub state: StateStore,
    pub index: Index,
}

pub type SharedHandle = Arc<RwLock<Shared>>;

/// Observer for upload batches. The engine reports; rendering (and the
/// batch-size threshold) is the caller's concern.
pub trait ProgressSink: Send + Sync {
    fn begin(&self, _total: u64) {}
    fn advance(&self) {}
    fn finish(&self) {}
}

/// Sink that renders nothing.
pub struct NoProgress;

impl ProgressSink for NoProgress {}

enum Upload {
    Done { address: String, size: u64, mtime: i64 },
    Vanished,
    Transient,
    Abandoned,
}

pub struct SyncEngine {
    shared: SharedHandle,
    net: Arc<dyn NetClient>,
    roots: Vec<PathBuf>,
    filter: FileFilter,
    add_options: AddOptions,
    net_timeout: Duration,
    version_tx: watch::Sender<u64>,
    progress: Arc<dyn ProgressSink>,
    retries: HashMap<PathBuf, Instant>,
    republish_retry_at: Option<Instant>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: SharedHandle,
        net: Arc<dyn NetClient>,
        roots: Vec<PathBuf>,
        filter: FileFilter,
        add_options: AddOptions,
        net_timeout: Duration,
        version_tx: watch::Sender<u64>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        SyncEngine {
            shared,
            net,
            roots,
            filter,
            add_options,
            net_timeout,
            version_tx,
            progress,
            retries: HashMap::new(),
            republish_retry_at: None,
        }
    }

    /// Startup reconciliation: scan the roots, diff against state, and
    /// settle the difference. Unchanged files are not touched and trigger
    /// no uploads.
    pub async fn initial_reconcile(&mut self) -> anyhow::Result<()> {
        let found = Scanner::new(self.roots.clone(), self.filter.clone()).scan();

        let mut on_disk: HashMap<String, &crate::scanner::ScannedFile> = HashMap::new();
        for file in &found {
            on_disk.insert(file.path.to_string_lossy().into_owned(), file);
        }

        let (deleted, modified, new_files, unchanged) = {
            let shared = self.shared.read().await;
            let mut deleted = Vec::new();
            let mut modified = Vec::new();
            let mut unchanged = 0usize;
            for (path, record) in &shared.state.get().files {
                match on_disk.get(path) {
                    None => deleted.push(PathBuf::from(path)),
                    Some(file) if file.mtime == record.mtime && file.size == record.size => {
                        unchanged += 1;
                    }
                    Some(file) => modified.push(file.path.clone()),
                }
            }
            let new_files: Vec<PathBuf> = found
                .iter()
                .filter(|f| {
                    !shared
                        .state
                        .get()
                        .files
                        .contains_key(&f.path.to_string_lossy().into_owned())
                })
                .map(|f| f.path.clone())
                .collect();
            (deleted, modified, new_files, unchanged)
        };

        tracing::info!(
            new = new_files.len(),
            modified = modified.len(),
            deleted = deleted.len(),
            unchanged,
            "initial reconciliation"
        );

        let mut mutated = false;
        for path in deleted {
            mutated |= self.handle_delete(&path).await;
        }

        let uploads = (modified.len() + new_files.len()) as u64;
        self.progress.begin(uploads);
        let mut failed = 0usize;
        for path in modified.into_iter().chain(new_files) {
            if self.handle_upsert(&path).await {
                mutated = true;
            } else {
                failed += 1;
            }
            self.progress.advance();
        }
        self.progress.finish();

        if failed > 0 {
            tracing::warn!(failed, "some files were not published; transient failures will be retried");
        }

        if mutated {
            self.republish().await;
        }
        Ok(())
    }

    /// Event loop. Consumes debounced watcher events until cancellation;
    /// wakes itself for retry backoff expiry.
    pub async fn run(mut self, mut events: mpsc::Receiver<FileEvent>, cancel: CancellationToken) {
        loop {
            let next_due = self
                .retries
                .values()
                .copied()
                .chain(self.republish_retry_at)
                .min();

            tokio::select! {
                _ = cancel.cancelled() => break,

                maybe = events.recv() => match maybe {
                    Some(event) => {
                        let mut batch = vec![event];
                        while let Ok(more) = events.try_recv() {
                            batch.push(more);
                        }
                        self.process_batch(batch).await;
                    }
                    None => break,
                },

                _ = sleep_until_opt(next_due), if next_due.is_some() => {
                    self.retry_tick().await;
                }
            }
        }

        // Shutdown: discard whatever is still queued so no new uploads
        // start, then let the task end. In-flight work already completed
        // above because event handling is awaited before the next select.
        while events.try_recv().is_ok() {}
        tracing::debug!("sync engine stopped");
    }

    async fn process_batch(&mut self, batch: Vec<FileEvent>) {
        let mut mutated = false;
        for event in batch {
            tracing::debug!(kind = %event.kind, path = %event.path.display(), "processing event");
            mutated |= match event.kind {
                FileEventKind::Create | FileEventKind::Modify => self.handle_upsert(&event.path).await,
                FileEventKind::Delete | FileEventKind::Rename => self.handle_delete(&event.path).await,
            };
        }
        if mutated || self.republish_retry_at.is_some() {
            self.republish().await;
        }
    }

    async fn retry_tick(&mut self) {
        let now = Instant::now();
        let due: Vec<PathBuf> = self
            .retries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(path, _)| path.clone())
            .collect();

        let mut mutated = false;
        for path in due {
            self.retries.remove(&path);
            tracing::info!(path = %path.display(), "retrying upload");
            mutated |= self.handle_upsert(&path).await;
        }

        let republish_due = self.republish_retry_at.is_some_and(|at| at <= now);
        if mutated || republish_due {
            self.republish().await;
        }
    }

    /// Create/Modify handling. Returns true when state or index mutated.
    pub async fn handle_upsert(&mut self, path: &Path) -> bool {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "file vanished before read; awaiting delete event");
                return false;
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::warn!(path = %path.display(), "permission denied, skipping");
                return false;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "cannot stat file, skipping");
                return false;
            }
        };
        let size = meta.len();
        let mtime = crate::util::unix_mtime(&meta);
        let path_str = path.to_string_lossy().into_owned();

        let existing = {
            let shared = self.shared.read().await;
            shared.state.get().files.get(&path_str).cloned()
        };

        if let Some(record) = &existing
            && record.mtime == mtime
            && record.size == size
        {
            tracing::debug!(path = %path.display(), "unchanged, skipping");
            return false;
        }

        if existing.is_none() {
            let mut shared = self.shared.write().await;
            if self.try_rename_move(&mut shared, path, size, mtime) {
                tracing::info!(path = %path.display(), "detected moved file, record re-keyed without re-upload");
                return true;
            }
        }

        match self.upload(path).await {
            Upload::Done { address, size, mtime } => {
                self.retries.remove(path);
                let mut shared = self.shared.write().await;
                match existing {
                    Some(record) => self.apply_update(&mut shared, &path_str, record, address, size, mtime),
                    None => self.apply_add(&mut shared, path, &path_str, address, size, mtime),
                }
            }
            Upload::Vanished => false,
            Upload::Abandoned => false,
            Upload::Transient => {
                self.retries.insert(path.to_path_buf(), Instant::now() + RETRY_BACKOFF);
                false
            }
        }
    }

    /// Delete handling (renames arrive here already resolved to deletes).
    pub async fn handle_delete(&mut self, path: &Path) -> bool {
        self.retries.remove(path);
        let path_str = path.to_string_lossy().into_owned();

        let mut shared = self.shared.write().await;
        if !shared.state.get().files.contains_key(&path_str) {
            tracing::debug!(path = %path.display(), "delete for untracked path, ignoring");
            return false;
        }
        let record = shared
            .state
            .get_mut()
            .files
            .remove(&path_str)
            .expect("presence checked above");

        match shared.index.get_by_id(record.index_id).map(|e| e.filename.clone()) {
            Some(filename) => {
                if let Err(err) = shared.index.remove(&filename) {
                    tracing::error!(%err, id = record.index_id, "index removal failed");
                }
                tracing::info!(path = %path.display(), id = record.index_id, "removed from collection");
            }
            None => {
                // State said the entry existed; the coupling invariant is
                // already broken, but dropping the record restores it.
                tracing::error!(id = record.index_id, path = %path.display(), "state referenced a missing index entry");
            }
        }
        true
    }

    async fn upload(&self, path: &Path) -> Upload {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Upload::Vanished,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "cannot stat file, abandoning");
                return Upload::Abandoned;
            }
        };
        let size = meta.len();
        let mtime = crate::util::unix_mtime(&meta);

        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Upload::Vanished,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::warn!(path = %path.display(), "permission denied, abandoning upload");
                return Upload::Abandoned;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "cannot open file, abandoning upload");
                return Upload::Abandoned;
            }
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::info!(path = %path.display(), size, "uploading");

        let reader = Box::new(ReaderStream::new(file));
        let result = tokio::time::timeout(self.net_timeout, self.net.add(reader, &name, &self.add_options)).await;

        match result {
            Ok(Ok(address)) => {
                tracing::info!(path = %path.display(), %address, "uploaded");
                Upload::Done { address, size, mtime }
            }
            Ok(Err(err)) if err.is_transient() => {
                tracing::warn!(path = %path.display(), %err, "transient upload failure, will retry");
                Upload::Transient
            }
            Ok(Err(NetError::DiskFull)) => {
                tracing::warn!(path = %path.display(), "network node out of disk space, abandoning upload");
                Upload::Abandoned
            }
            Ok(Err(err)) => {
                if !path.exists() {
                    tracing::debug!(path = %path.display(), "file vanished mid-upload");
                    return Upload::Vanished;
                }
                tracing::warn!(path = %path.display(), %err, "upload failed, abandoning");
                Upload::Abandoned
            }
            Err(_) => {
                tracing::warn!(path = %path.display(), timeout = ?self.net_timeout, "upload timed out, will retry");
                Upload::Transient
            }
        }
    }

    fn apply_update(
        &self,
        shared: &mut Shared,
        path_str: &str,
        record: FileRecord,
        address: String,
        size: u64,
        mtime: i64,
    ) -> bool {
        let Some(filename) = shared.index.get_by_id(record.index_id).map(|e| e.filename.clone()) else {
            tracing::error!(id = record.index_id, "state referenced a missing index entry, re-adding");
            let path = PathBuf::from(path_str);
            return self.apply_add(shared, &path, path_str, address, size, mtime);
        };

        if let Err(err) = shared.index.update_address(&filename, &address) {
            tracing::error!(%err, "index update failed");
            return false;
        }
        shared.state.get_mut().files.insert(
            path_str.to_string(),
            FileRecord {
                content_address: address,
                mtime,
                size,
                index_id: record.index_id,
            },
        );
        true
    }

    fn apply_add(
        &self,
        shared: &mut Shared,
        path: &Path,
        path_str: &str,
        address: String,
        size: u64,
        mtime: i64,
    ) -> bool {
        let Some(basename) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            tracing::warn!(path = %path.display(), "unusable filename, skipping");
            return false;
        };
        let extension = crate::filter::extension_of(path).unwrap_or_default();

        // Disambiguate only the record being created; existing entries are
        // never rewritten in response to a new collision.
        let mut name = basename.clone();
        if let Some(entry) = shared.index.get(&name).cloned() {
            match owner_of(&shared.state, entry.id) {
                None => {
                    // An index entry with no owning state record: the state
                    // save was lost (crash between index and state writes).
                    // Refresh the address instead of appending a duplicate.
                    if let Err(err) = shared.index.update_address(&name, &address) {
                        tracing::error!(%err, "index recovery update failed");
                        return false;
                    }
                    shared.state.get_mut().files.insert(
                        path_str.to_string(),
                        FileRecord { content_address: address, mtime, size, index_id: entry.id },
                    );
                    tracing::info!(path = %path.display(), id = entry.id, "recovered index entry after incomplete save");
                    return true;
                }
                Some(_) => match self.relative_name(path) {
                    Some(rel) => name = rel,
                    None => {
                        tracing::warn!(path = %path.display(), "basename collision outside any watched root, skipping");
                        return false;
                    }
                },
            }
        } else if shared.index.has_basename(&basename) {
            match self.relative_name(path) {
                Some(rel) => name = rel,
                None => {
                    tracing::warn!(path = %path.display(), "basename collision outside any watched root, skipping");
                    return false;
                }
            }
        }

        // The disambiguated name may itself exist (same relative path seen
        // before a crash); apply the same recovery rule.
        if let Some(entry) = shared.index.get(&name).cloned() {
            if owner_of(&shared.state, entry.id).is_some() {
                tracing::warn!(path = %path.display(), %name, "cannot disambiguate filename, skipping");
                return false;
            }
            if let Err(err) = shared.index.update_address(&name, &address) {
                tracing::error!(%err, "index recovery update failed");
                return false;
            }
            shared.state.get_mut().files.insert(
                path_str.to_string(),
                FileRecord { content_address: address, mtime, size, index_id: entry.id },
            );
            return true;
        }

        let entry = match shared.index.add(&name, &address, &extension) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(%err, "index append failed");
                return false;
            }
        };
        shared.state.get_mut().files.insert(
            path_str.to_string(),
            FileRecord { content_address: address, mtime, size, index_id: entry.id },
        );
        tracing::info!(path = %path.display(), id = entry.id, name = %entry.filename, "added to collection");
        true
    }

    /// Moved-file detection: a create whose `(mtime, size)` exactly
    /// matches one tracked file that no longer exists on disk is a rename;
    /// the record is re-keyed and the index entry re-labelled without
    /// re-uploading.
    fn try_rename_move(&self, shared: &mut Shared, path: &Path, size: u64, mtime: i64) -> bool {
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };

        let mut candidates = shared
            .state
            .get()
            .files
            .iter()
            .filter(|(old, record)| {
                record.mtime == mtime && record.size == size && !Path::new(old).exists()
            })
            .map(|(old, record)| (old.clone(), record.clone()));
        let Some((old_path, record)) = candidates.next() else {
            return false;
        };
        if candidates.next().is_some() {
            // Ambiguous; fall back to a plain upload.
            return false;
        }
        drop(candidates);

        let Some(old_entry) = shared.index.get_by_id(record.index_id).cloned() else {
            return false;
        };

        let new_name = if old_entry.filename == basename {
            basename.to_string()
        } else if shared.index.get(basename).is_none() && !shared.index.has_basename(basename) {
            basename.to_string()
        } else {
            match self.relative_name(path) {
                Some(rel) if shared.index.get(&rel).is_none() => rel,
                _ => return false,
            }
        };

        if new_name != old_entry.filename
            && let Err(err) = shared.index.rename(&old_entry.filename, &new_name)
        {
            tracing::warn!(%err, "rename re-label failed, falling back to upload");
            return false;
        }

        let state = shared.state.get_mut();
        state.files.remove(&old_path);
        state.files.insert(path.to_string_lossy().into_owned(), record);
        true
    }

    /// Path relative to the containing watched root, with forward slashes.
    fn relative_name(&self, path: &Path) -> Option<String> {
        for root in &self.roots {
            if let Ok(rel) = path.strip_prefix(root) {
                let parts: Vec<&str> = rel
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect();
                if !parts.is_empty() {
                    return Some(parts.join("/"));
                }
            }
        }
        None
    }

    /// The republish sequence: persist and upload the index, move the
    /// mutable name, advance the version, stamp the change time, persist
    /// state, and wake the announcer. Name-binding failure does not block
    /// the version increment; index persistence or upload failure defers
    /// the whole sequence to the retry tick.
    pub async fn republish(&mut self) {
        let mut shared = self.shared.write().await;

        if let Err(err) = shared.index.save() {
            tracing::error!(%err, "saving index failed, republish deferred");
            self.republish_retry_at = Some(Instant::now() + RETRY_BACKOFF);
            return;
        }

        let index_address = match self.upload_index(&shared).await {
            Some(address) => address,
            None => {
                self.republish_retry_at = Some(Instant::now() + RETRY_BACKOFF);
                return;
            }
        };
        tracing::info!(address = %index_address, "index uploaded");
        shared.state.get_mut().last_index_address = index_address.clone();

        match self.bind_name(&index_address).await {
            Some(record) => {
                tracing::info!(name = %record.name, "name published");
                shared.state.get_mut().ipns = record.name;
            }
            None => {
                tracing::warn!("name binding failed, continuing; next republish will retry the binding");
            }
        }

        let version = {
            let state = shared.state.get_mut();
            state.version += 1;
            state.last_change_timestamp = now_unix();
            state.version
        };

        if let Err(err) = shared.state.save() {
            // The flush timer retries while the state stays dirty.
            tracing::error!(%err, "saving state failed");
        }

        self.republish_retry_at = None;
        self.version_tx.send_replace(version);
        tracing::info!(version, "republish complete");
    }

    async fn upload_index(&self, shared: &Shared) -> Option<String> {
        let file = match tokio::fs::File::open(shared.index.path()).await {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(%err, "cannot open saved index");
                return None;
            }
        };
        let reader = Box::new(ReaderStream::new(file));
        let add_options = AddOptions::default();
        let upload = self.net.add(reader, crate::index::INDEX_FILE, &add_options);
        match tokio::time::timeout(self.net_timeout, upload).await {
            Ok(Ok(address)) => Some(address),
            Ok(Err(err)) => {
                tracing::warn!(%err, "index upload failed, republish deferred");
                None
            }
            Err(_) => {
                tracing::warn!("index upload timed out, republish deferred");
                None
            }
        }
    }

    async fn bind_name(&self, address: &str) -> Option<mediapub_core::NameRecord> {
        let options = NamePublishOptions::default();
        match tokio::time::timeout(self.net_timeout, self.net.publish_name(address, &options)).await {
            Ok(Ok(record)) => return Some(record),
            Ok(Err(err)) if !err.is_transient() => {
                tracing::warn!(%err, "name publish failed");
                return None;
            }
            Ok(Err(err)) => tracing::warn!(%err, "name publish failed, retrying in offline mode"),
            Err(_) => tracing::warn!("name publish timed out, retrying in offline mode"),
        }

        let offline = NamePublishOptions {
            allow_offline: true,
            ..NamePublishOptions::default()
        };
        match tokio::time::timeout(self.net_timeout, self.net.publish_name(address, &offline)).await {
            Ok(Ok(record)) => Some(record),
            Ok(Err(err)) => {
                tracing::warn!(%err, "offline name publish failed");
                None
            }
            Err(_) => {
                tracing::warn!("offline name publish timed out");
                None
            }
        }
    }
}

fn owner_of(state: &StateStore, index_id: u64) -> Option<String> {
    state
        .get()
        .files
        .iter()
        .find(|(_, record)| record.index_id == index_id)
        .map(|(path, _)| path.clone())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
