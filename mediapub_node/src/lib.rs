//! The mediapub daemon.
//!
//! Publishes a directory of media files to a content-addressed network,
//! maintains the collection index, and announces the current index to
//! subscribers over pub-sub. [`run_node`] wires the pieces together and
//! runs until interrupted:
//!
//! - startup: lockfile → keys → state/index load → initial reconciliation
//! - steady state: watcher → sync engine (the single writer), announcer
//!   heartbeats, periodic state flush
//! - shutdown: stop the watcher, let the engine finish in-flight work,
//!   cancel the announcer, flush state, close the network client, release
//!   the lock. A second signal forces immediate exit.

use std::sync::Arc;

use anyhow::Context;
use mediapub_core::NetClient;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;

pub mod announcer;
pub mod config;
pub mod filter;
pub mod index;
pub mod keys;
pub mod lockfile;
pub mod scanner;
pub mod state;
pub mod sync;
pub mod util;
pub mod watcher;

use announcer::Announcer;
use config::Config;
use filter::FileFilter;
use index::Index;
use keys::KeyStore;
use lockfile::Lockfile;
use state::StateStore;
use sync::{ProgressSink, Shared, SharedHandle, SyncEngine};
use watcher::FsWatcher;

/// Subdirectory of the base directory holding the key pair.
pub const KEYS_DIR: &str = "keys";

/// Runs the daemon until a termination signal arrives.
pub async fn run_node(
    config: Config,
    net: Arc<dyn NetClient>,
    progress: Arc<dyn ProgressSink>,
) -> anyhow::Result<()> {
    let base_dir = config.base_dir();
    std::fs::create_dir_all(&base_dir)
        .with_context(|| format!("creating base directory {}", base_dir.display()))?;

    let mut lock = Lockfile::new(&base_dir);
    lock.acquire().context("acquiring single-instance lock")?;
    tracing::info!(base_dir = %base_dir.display(), "lock acquired");

    let keys = Arc::new(KeyStore::init(base_dir.join(KEYS_DIR)).context("initializing signing keys")?);
    let state = StateStore::load(base_dir.join(state::STATE_FILE)).context("loading state")?;
    let index = Index::load(base_dir.join(index::INDEX_FILE)).context("loading index")?;

    let initial_version = state.get().version;
    let shared: SharedHandle = Arc::new(RwLock::new(Shared { state, index }));

    match tokio::time::timeout(std::time::Duration::from_secs(10), net.is_available()).await {
        Ok(Ok(())) => tracing::info!("content network reachable"),
        Ok(Err(err)) => tracing::warn!(%err, "content network not reachable; uploads will be retried"),
        Err(_) => tracing::warn!("content network availability probe timed out; uploads will be retried"),
    }

    let (version_tx, version_rx) = watch::channel(initial_version);
    let cancel = CancellationToken::new();

    let filter = FileFilter::new(&config.extensions);
    let mut engine = SyncEngine::new(
        shared.clone(),
        net.clone(),
        config.watched_roots(),
        filter.clone(),
        config.net.add_options(),
        config.net.timeout(),
        version_tx,
        progress,
    );

    engine.initial_reconcile().await.context("initial reconciliation")?;

    let (fs_watcher, events) = FsWatcher::spawn(
        config.watched_roots(),
        filter,
        config.debounce(),
        config.behavior.event_queue_size,
        cancel.child_token(),
    )
    .context("starting filesystem watcher")?;

    let engine_task = tokio::spawn(engine.run(events, cancel.child_token()));

    let announcer_task = if config.announce.enabled {
        let announcer = Announcer::new(
            shared.clone(),
            net.clone(),
            keys.clone(),
            config.announce.topic.clone(),
            config.announce_interval(),
            version_rx,
        );
        tracing::info!(
            topic = %config.announce.topic,
            interval_secs = config.announce.interval_secs,
            "announcements enabled"
        );
        Some(tokio::spawn(announcer.run(cancel.child_token())))
    } else {
        None
    };

    let flush_task = tokio::spawn(flush_loop(
        shared.clone(),
        config.state_save_interval(),
        cancel.child_token(),
    ));

    tracing::info!("daemon running");
    shutdown_signal().await;
    tracing::info!("shutting down");
    cancel.cancel();

    // A second signal skips the orderly teardown. The lock may be left
    // stale; the next startup detects the dead pid and clears it.
    tokio::spawn(async {
        shutdown_signal().await;
        tracing::warn!("second signal received, forcing exit");
        std::process::exit(1);
    });

    fs_watcher.stopped().await;
    let _ = engine_task.await;
    if let Some(task) = announcer_task {
        let _ = task.await;
    }
    let _ = flush_task.await;

    {
        let mut shared = shared.write().await;
        if shared.state.is_dirty()
            && let Err(err) = shared.state.save()
        {
            tracing::error!(%err, "final state flush failed");
        }
    }

    if let Err(err) = net.close().await {
        tracing::warn!(%err, "closing network client failed");
    }
    lock.release().context("releasing lock")?;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Periodically persists the state when it has changed since last flush.
async fn flush_loop(shared: SharedHandle, every: std::time::Duration, cancel: CancellationToken) {
    let start = tokio::time::Instant::now() + every;
    let mut ticker = tokio::time::interval_at(start, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let mut shared = shared.write().await;
                if shared.state.is_dirty() {
                    match shared.state.save() {
                        Ok(()) => tracing::debug!("periodic state flush"),
                        Err(err) => tracing::error!(%err, "periodic state flush failed"),
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("installing SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => tracing::info!("received SIGINT"),
        _ = terminate.recv() => tracing::info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received interrupt");
}
