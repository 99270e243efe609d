//! One-shot recursive enumeration of the watched roots.
//!
//! Produces the filtered file list the sync engine reconciles against at
//! startup, and the listing behind the dry-run command. Continuous
//! observation is the watcher's job.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::filter::{self, FileFilter, MAX_BASENAME_LEN};
use crate::util::unix_mtime;

/// Metadata for a single file admitted by the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub mtime: i64,
}

/// Walker over the configured roots.
#[derive(Debug, Clone)]
pub struct Scanner {
    roots: Vec<PathBuf>,
    filter: FileFilter,
}

impl Scanner {
    pub fn new(roots: Vec<PathBuf>, filter: FileFilter) -> Self {
        Scanner { roots, filter }
    }

    /// Scans every root. A root that is missing or unreadable is warned
    /// about and skipped; the remaining roots are still scanned.
    pub fn scan(&self) -> Vec<ScannedFile> {
        let mut files = Vec::new();

        for root in &self.roots {
            match std::fs::metadata(root) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    tracing::warn!(root = %root.display(), "watched path is not a directory, skipping");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(root = %root.display(), %err, "cannot access watched root, skipping");
                    continue;
                }
            }

            tracing::info!(root = %root.display(), "scanning");
            self.scan_root(root, &mut files);
        }

        // Deterministic ordering keeps index ids stable for a given tree.
        files.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::info!(count = files.len(), "scan complete");
        files
    }

    fn scan_root(&self, root: &Path, files: &mut Vec<ScannedFile>) {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            // Never descend into hidden directories; the root itself is
            // exempt so a hidden root can still be watched deliberately.
            .filter_entry(|entry| {
                entry.depth() == 0
                    || entry
                        .file_name()
                        .to_str()
                        .map(|name| !filter::is_hidden(name))
                        .unwrap_or(true)
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if err.io_error().map(|e| e.kind() == std::io::ErrorKind::PermissionDenied) == Some(true) {
                        tracing::warn!(%err, "permission denied, skipping");
                    } else {
                        tracing::warn!(%err, "error accessing path, skipping");
                    }
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                continue;
            }
            if entry.path_is_symlink() {
                tracing::debug!(path = %entry.path().display(), "skipping symbolic link");
                continue;
            }

            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 filename");
                continue;
            };

            if filter::is_temp(&name) {
                tracing::debug!(path = %entry.path().display(), "skipping temporary file");
                continue;
            }
            if name.len() > MAX_BASENAME_LEN {
                tracing::warn!(path = %entry.path().display(), len = name.len(), "filename too long, skipping");
                continue;
            }
            if !self.filter.allows(entry.path()) {
                tracing::debug!(path = %entry.path().display(), "skipping non-matching extension");
                continue;
            }

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), %err, "cannot stat file, skipping");
                    continue;
                }
            };

            let extension = filter::extension_of(entry.path()).unwrap_or_default();
            files.push(ScannedFile {
                path: entry.path().to_path_buf(),
                name,
                extension,
                size: meta.len(),
                mtime: unix_mtime(&meta),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scanner_for(root: &Path) -> Scanner {
        Scanner::new(vec![root.to_path_buf()], FileFilter::new(["mp3", "flac"]))
    }

    #[test]
    fn finds_matching_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp3"), b"aaa").unwrap();
        fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("sub/deep/b.flac"), b"bbbb").unwrap();
        fs::write(dir.path().join("sub/notes.txt"), b"x").unwrap();

        let mut files = scanner_for(dir.path()).scan();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.mp3");
        assert_eq!(files[0].extension, "mp3");
        assert_eq!(files[0].size, 3);
        assert!(files[0].mtime > 0);
        assert_eq!(files[1].name, "b.flac");
    }

    #[test]
    fn skips_hidden_and_temp_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden.mp3"), b"x").unwrap();
        fs::write(dir.path().join("song.mp3~"), b"x").unwrap();
        fs::write(dir.path().join(".DS_Store"), b"x").unwrap();
        fs::write(dir.path().join("keep.mp3"), b"x").unwrap();

        let files = scanner_for(dir.path()).scan();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "keep.mp3");
    }

    #[test]
    fn does_not_descend_into_hidden_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".cache")).unwrap();
        fs::write(dir.path().join(".cache/secret.mp3"), b"x").unwrap();
        fs::write(dir.path().join("visible.mp3"), b"x").unwrap();

        let files = scanner_for(dir.path()).scan();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "visible.mp3");
    }

    #[cfg(unix)]
    #[test]
    fn skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.mp3"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.mp3"), dir.path().join("link.mp3")).unwrap();

        let files = scanner_for(dir.path()).scan();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "real.mp3");
    }

    #[test]
    fn missing_root_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp3"), b"x").unwrap();

        let scanner = Scanner::new(
            vec![dir.path().to_path_buf(), PathBuf::from("/definitely/not/here")],
            FileFilter::new(["mp3"]),
        );
        assert_eq!(scanner.scan().len(), 1);
    }
}
