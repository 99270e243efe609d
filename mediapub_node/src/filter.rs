//! Skip rules shared by the scanner and the watcher.
//!
//! Rule order matters and mirrors the scan pipeline: symlink, permission,
//! hidden, temp pattern, name length, extension. The first five are
//! per-entry predicates here; the allow-set lives in [`FileFilter`].

use std::collections::HashSet;
use std::path::Path;

/// Longest basename admitted into the index, in code units.
pub const MAX_BASENAME_LEN: usize = 255;

/// Temp-file suffixes, matched case-insensitively.
const TEMP_SUFFIXES: &[&str] = &["~", ".tmp", ".temp", ".swp", ".swo", ".swn"];

/// Exact junk file names, matched case-insensitively.
const JUNK_NAMES: &[&str] = &[".ds_store", "thumbs.db", "desktop.ini"];

/// True when the basename starts with a dot.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// True for editor/OS temp droppings.
pub fn is_temp(name: &str) -> bool {
    let lower = name.to_lowercase();
    JUNK_NAMES.contains(&lower.as_str()) || TEMP_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// True when any component of `path` below `root` is hidden. Used by the
/// watcher, whose recursive OS watch also reports events from directories
/// the scanner would never descend into.
pub fn under_hidden_dir(path: &Path, root: &Path) -> bool {
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    rel.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(is_hidden)
            .unwrap_or(false)
    })
}

/// The lower-cased extension after the final dot, without the dot.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

/// The case-insensitive extension allow-set.
#[derive(Debug, Clone)]
pub struct FileFilter {
    extensions: HashSet<String>,
}

impl FileFilter {
    /// Builds the allow-set; entries are lower-cased and a leading dot is
    /// stripped, so `MP3` and `.mp3` both admit `song.mp3`.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
            .collect();
        FileFilter { extensions }
    }

    /// True when the path carries an allowed extension.
    pub fn allows(&self, path: &Path) -> bool {
        match extension_of(path) {
            Some(ext) => self.extensions.contains(&ext),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn hidden_and_temp_names() {
        assert!(is_hidden(".env"));
        assert!(!is_hidden("song.mp3"));

        assert!(is_temp("draft~"));
        assert!(is_temp("upload.MP3.tmp"));
        assert!(is_temp("notes.swp"));
        assert!(is_temp(".DS_Store"));
        assert!(is_temp("Thumbs.db"));
        assert!(is_temp("DESKTOP.INI"));
        assert!(!is_temp("album.mp3"));
    }

    #[test]
    fn extension_allow_set_is_case_insensitive() {
        let filter = FileFilter::new(["MP3", ".flac"]);
        assert!(filter.allows(Path::new("/m/a.mp3")));
        assert!(filter.allows(Path::new("/m/b.MP3")));
        assert!(filter.allows(Path::new("/m/c.FLAC")));
        assert!(!filter.allows(Path::new("/m/d.ogg")));
        assert!(!filter.allows(Path::new("/m/no_extension")));
    }

    #[test]
    fn hidden_dir_detection_is_relative_to_root() {
        let root = PathBuf::from("/m");
        assert!(under_hidden_dir(Path::new("/m/.cache/a.mp3"), &root));
        assert!(under_hidden_dir(Path::new("/m/sub/.hidden/a.mp3"), &root));
        assert!(!under_hidden_dir(Path::new("/m/sub/a.mp3"), &root));
        // A hidden component in the root itself does not count.
        assert!(!under_hidden_dir(Path::new("/home/.local/m/a.mp3"), Path::new("/home/.local/m")));
    }
}
