//! Continuous filesystem observation.
//!
//! Raw OS notifications are noisy: a single download produces dozens of
//! write events, and editors rename temp files into place. The watcher
//! tames this with a per-path debounce window — repeated events for the
//! same path collapse into one emission carrying the last kind observed —
//! and applies the same skip rules as the scanner before anything reaches
//! the sync engine. The output channel is bounded; the debouncer blocks
//! when the engine falls behind, which is fine because the engine is the
//! only consumer and drains promptly.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::filter::{self, FileFilter, MAX_BASENAME_LEN};

/// Kind of a (debounced) filesystem event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Create,
    Modify,
    Delete,
    /// Old name of a rename. Emitted as `Delete` unless a `Create` for the
    /// same path lands inside the debounce window.
    Rename,
}

impl fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileEventKind::Create => "CREATE",
            FileEventKind::Modify => "MODIFY",
            FileEventKind::Delete => "DELETE",
            FileEventKind::Rename => "RENAME",
        };
        f.write_str(s)
    }
}

/// A debounced event delivered to the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
    pub timestamp: SystemTime,
}

/// Per-path collapse of event bursts.
///
/// Each offered event (re)arms the path's timer to `window` from now; when
/// the timer fires, one event with the last observed kind is due. A
/// `Rename` that never saw a follow-up `Create` resolves to `Delete`.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Pending>,
}

#[derive(Debug)]
struct Pending {
    kind: FileEventKind,
    deadline: Instant,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Debouncer {
            window,
            pending: HashMap::new(),
        }
    }

    /// Records an event, collapsing into any pending one for the path.
    pub fn offer(&mut self, path: PathBuf, kind: FileEventKind, now: Instant) {
        let deadline = now + self.window;
        self.pending
            .entry(path)
            .and_modify(|p| {
                p.kind = kind;
                p.deadline = deadline;
            })
            .or_insert(Pending { kind, deadline });
    }

    /// The earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Removes and returns all events whose window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<FileEvent> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        due.into_iter()
            .map(|path| {
                let pending = self.pending.remove(&path).expect("due path present");
                let kind = match pending.kind {
                    FileEventKind::Rename => FileEventKind::Delete,
                    other => other,
                };
                FileEvent {
                    path,
                    kind,
                    timestamp: SystemTime::now(),
                }
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Maps a raw notification to per-path event kinds. Returns an empty list
/// for notifications the pipeline ignores (access, metadata-only noise on
/// some platforms still maps to Modify and is de-duplicated downstream).
fn classify(event: &notify::Event) -> Vec<(PathBuf, FileEventKind)> {
    use notify::EventKind;
    use notify::event::{ModifyKind, RenameMode};

    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), FileEventKind::Create))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), FileEventKind::Delete))
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => event
                .paths
                .first()
                .map(|p| (p.clone(), FileEventKind::Rename))
                .into_iter()
                .collect(),
            RenameMode::To => event
                .paths
                .first()
                .map(|p| (p.clone(), FileEventKind::Create))
                .into_iter()
                .collect(),
            RenameMode::Both => {
                let mut out = Vec::new();
                if let Some(from) = event.paths.first() {
                    out.push((from.clone(), FileEventKind::Rename));
                }
                if let Some(to) = event.paths.get(1) {
                    out.push((to.clone(), FileEventKind::Create));
                }
                out
            }
            _ => event
                .paths
                .iter()
                .map(|p| (p.clone(), FileEventKind::Rename))
                .collect(),
        },
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), FileEventKind::Modify))
            .collect(),
        _ => Vec::new(),
    }
}

/// Emission-side filtering: the scanner's skip rules, applied to live
/// events. `kind` matters because absent files (deletes) cannot be
/// stat-ed.
fn admit(path: &Path, kind: FileEventKind, roots: &[PathBuf], filter: &FileFilter) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    if filter::is_hidden(name) || filter::is_temp(name) {
        return false;
    }
    if name.len() > MAX_BASENAME_LEN {
        tracing::warn!(path = %path.display(), "filename too long, ignoring event");
        return false;
    }
    if roots.iter().any(|root| filter::under_hidden_dir(path, root)) {
        return false;
    }
    if !filter.allows(path) {
        return false;
    }

    // Live-path rules: skip directories and symlinks. Both only apply when
    // the entry still exists.
    if !matches!(kind, FileEventKind::Delete | FileEventKind::Rename)
        && let Ok(meta) = std::fs::symlink_metadata(path)
    {
        if meta.is_dir() {
            return false;
        }
        if meta.file_type().is_symlink() {
            tracing::debug!(path = %path.display(), "ignoring symbolic link");
            return false;
        }
    }

    true
}

/// Handle keeping the OS watcher and its forwarding task alive.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl FsWatcher {
    /// Starts watching `roots` recursively and returns the receiving end
    /// of the bounded, debounced event channel.
    ///
    /// Directories created under a root later are covered by the recursive
    /// OS watch; hidden subtrees are excluded by the emission filter.
    pub fn spawn(
        roots: Vec<PathBuf>,
        filter: FileFilter,
        window: Duration,
        queue_size: usize,
        cancel: CancellationToken,
    ) -> anyhow::Result<(FsWatcher, mpsc::Receiver<FileEvent>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(queue_size);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // Runs on the notify backend thread; never block it.
            let _ = raw_tx.send(res);
        })?;

        for root in &roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => tracing::info!(root = %root.display(), "watching"),
                Err(err) => {
                    tracing::warn!(root = %root.display(), %err, "cannot watch root, continuing without it")
                }
            }
        }

        let task = tokio::spawn(debounce_loop(raw_rx, out_tx, roots, filter, window, cancel));

        Ok((
            FsWatcher {
                _watcher: watcher,
                task,
            },
            out_rx,
        ))
    }

    /// Waits for the forwarding task to wind down after cancellation.
    pub async fn stopped(self) {
        let _ = self.task.await;
    }
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    out_tx: mpsc::Sender<FileEvent>,
    roots: Vec<PathBuf>,
    filter: FileFilter,
    window: Duration,
    cancel: CancellationToken,
) {
    let mut debouncer = Debouncer::new(window);

    loop {
        let next = debouncer.next_deadline();
        tokio::select! {
            _ = cancel.cancelled() => break,

            raw = raw_rx.recv() => match raw {
                Some(Ok(event)) => {
                    let now = Instant::now();
                    for (path, kind) in classify(&event) {
                        if admit(&path, kind, &roots, &filter) {
                            tracing::debug!(%kind, path = %path.display(), "file event");
                            debouncer.offer(path, kind, now);
                        }
                    }
                }
                Some(Err(err)) => tracing::warn!(%err, "watcher backend error"),
                None => break,
            },

            _ = sleep_until_opt(next), if next.is_some() => {
                for event in debouncer.take_due(Instant::now()) {
                    // Blocks when the engine is behind; bounded by design.
                    if out_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(300);

    fn path(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn burst_collapses_to_one_event_with_last_kind() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();

        d.offer(path("/m/a.mp3"), FileEventKind::Create, t0);
        d.offer(path("/m/a.mp3"), FileEventKind::Modify, t0 + Duration::from_millis(50));
        d.offer(path("/m/a.mp3"), FileEventKind::Modify, t0 + Duration::from_millis(100));

        // Still inside the window measured from the latest event.
        assert!(d.take_due(t0 + Duration::from_millis(350)).is_empty());

        let due = d.take_due(t0 + Duration::from_millis(401));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, FileEventKind::Modify);
        assert!(d.is_empty());
    }

    #[test]
    fn ten_rapid_writes_emit_once() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        for i in 0..10 {
            d.offer(path("/m/a.mp3"), FileEventKind::Modify, t0 + Duration::from_millis(50 * i));
        }
        // 450 ms after the last offer.
        let due = d.take_due(t0 + Duration::from_millis(900));
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn unpaired_rename_becomes_delete() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.offer(path("/m/old.mp3"), FileEventKind::Rename, t0);

        let due = d.take_due(t0 + WINDOW);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, FileEventKind::Delete);
    }

    #[test]
    fn rename_followed_by_create_stays_create() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.offer(path("/m/a.mp3"), FileEventKind::Rename, t0);
        d.offer(path("/m/a.mp3"), FileEventKind::Create, t0 + Duration::from_millis(10));

        let due = d.take_due(t0 + Duration::from_millis(10) + WINDOW);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, FileEventKind::Create);
    }

    #[test]
    fn distinct_paths_have_independent_windows() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.offer(path("/m/a.mp3"), FileEventKind::Create, t0);
        d.offer(path("/m/b.mp3"), FileEventKind::Create, t0 + Duration::from_millis(200));

        let first = d.take_due(t0 + WINDOW);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].path, path("/m/a.mp3"));

        let second = d.take_due(t0 + Duration::from_millis(200) + WINDOW);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].path, path("/m/b.mp3"));
    }

    #[test]
    fn next_deadline_tracks_the_earliest_path() {
        let mut d = Debouncer::new(WINDOW);
        assert!(d.next_deadline().is_none());

        let t0 = Instant::now();
        d.offer(path("/m/b.mp3"), FileEventKind::Create, t0 + Duration::from_millis(100));
        d.offer(path("/m/a.mp3"), FileEventKind::Create, t0);
        assert_eq!(d.next_deadline(), Some(t0 + WINDOW));
    }

    #[test]
    fn admit_applies_scanner_rules() {
        let roots = vec![path("/m")];
        let filter = FileFilter::new(["mp3"]);

        assert!(admit(&path("/m/a.mp3"), FileEventKind::Delete, &roots, &filter));
        assert!(!admit(&path("/m/.a.mp3"), FileEventKind::Delete, &roots, &filter));
        assert!(!admit(&path("/m/a.mp3.tmp"), FileEventKind::Delete, &roots, &filter));
        assert!(!admit(&path("/m/a.ogg"), FileEventKind::Delete, &roots, &filter));
        assert!(!admit(&path("/m/.cache/a.mp3"), FileEventKind::Delete, &roots, &filter));
    }

    #[test]
    fn classify_maps_renames() {
        use notify::EventKind;
        use notify::event::{ModifyKind, RenameMode};

        let event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![path("/m/old.mp3"), path("/m/new.mp3")],
            attrs: Default::default(),
        };
        let mapped = classify(&event);
        assert_eq!(
            mapped,
            vec![
                (path("/m/old.mp3"), FileEventKind::Rename),
                (path("/m/new.mp3"), FileEventKind::Create),
            ]
        );
    }
}
