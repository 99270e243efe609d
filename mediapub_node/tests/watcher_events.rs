//! Live watcher tests against the real OS notification facility.
//!
//! These exercise the full pipeline — native notifications, filtering and
//! per-path debouncing — with actual filesystem writes in a tempdir.
//! Timeouts are generous because notification latency varies by platform
//! and load.
//!
//! To run: `cargo test -p mediapub_node --test watcher_events`

use std::path::{Path, PathBuf};
use std::time::Duration;

use mediapub_node::filter::FileFilter;
use mediapub_node::watcher::{FileEvent, FileEventKind, FsWatcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WINDOW: Duration = Duration::from_millis(300);
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn spawn_watcher(root: &Path) -> (FsWatcher, mpsc::Receiver<FileEvent>, CancellationToken) {
    let cancel = CancellationToken::new();
    let (watcher, events) = FsWatcher::spawn(
        vec![root.to_path_buf()],
        FileFilter::new(["mp3"]),
        WINDOW,
        100,
        cancel.clone(),
    )
    .expect("watcher starts");
    (watcher, events, cancel)
}

async fn recv(events: &mut mpsc::Receiver<FileEvent>) -> FileEvent {
    tokio::time::timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("an event should arrive")
        .expect("channel open")
}

async fn expect_quiet(events: &mut mpsc::Receiver<FileEvent>, for_long: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(for_long, events.recv()).await {
        panic!("unexpected event: {:?} for {}", event.kind, event.path.display());
    }
}

#[tokio::test]
async fn file_creation_is_observed() {
    let dir = tempfile::tempdir().unwrap();
    let (_watcher, mut events, cancel) = spawn_watcher(dir.path());

    let path = dir.path().join("song.mp3");
    std::fs::write(&path, b"abc").unwrap();

    let event = recv(&mut events).await;
    assert_eq!(event.path, path);
    assert!(
        matches!(event.kind, FileEventKind::Create | FileEventKind::Modify),
        "creation surfaces as create (or collapsed modify), got {:?}",
        event.kind
    );

    cancel.cancel();
}

#[tokio::test]
async fn rapid_writes_collapse_to_one_event() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("burst.mp3");
    std::fs::write(&path, b"seed").unwrap();
    // Let the creation settle before watching.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_watcher, mut events, cancel) = spawn_watcher(dir.path());

    for i in 0..10u8 {
        std::fs::write(&path, vec![i; 16]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let event = recv(&mut events).await;
    assert_eq!(event.path, path);
    assert_eq!(event.kind, FileEventKind::Modify);

    // The burst produced exactly one emission.
    expect_quiet(&mut events, Duration::from_millis(700)).await;

    cancel.cancel();
}

#[tokio::test]
async fn deletion_is_observed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gone.mp3");
    std::fs::write(&path, b"abc").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_watcher, mut events, cancel) = spawn_watcher(dir.path());
    std::fs::remove_file(&path).unwrap();

    let event = recv(&mut events).await;
    assert_eq!(event.path, path);
    assert_eq!(event.kind, FileEventKind::Delete);

    cancel.cancel();
}

#[tokio::test]
async fn filtered_paths_never_surface() {
    let dir = tempfile::tempdir().unwrap();
    let (_watcher, mut events, cancel) = spawn_watcher(dir.path());

    std::fs::write(dir.path().join(".hidden.mp3"), b"x").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
    std::fs::write(dir.path().join("draft.mp3.tmp"), b"x").unwrap();

    // Only an allowed, visible file produces an event.
    let real = dir.path().join("real.mp3");
    std::fs::write(&real, b"x").unwrap();

    let event = recv(&mut events).await;
    assert_eq!(event.path, real);

    expect_quiet(&mut events, Duration::from_millis(700)).await;
    cancel.cancel();
}

#[tokio::test]
async fn new_subdirectories_are_covered() {
    let dir = tempfile::tempdir().unwrap();
    let (_watcher, mut events, cancel) = spawn_watcher(dir.path());

    let sub: PathBuf = dir.path().join("albums");
    std::fs::create_dir(&sub).unwrap();
    // Give the recursive watch a moment to cover the new directory.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let path = sub.join("track.mp3");
    std::fs::write(&path, b"abc").unwrap();

    let event = recv(&mut events).await;
    assert_eq!(event.path, path);

    cancel.cancel();
}
