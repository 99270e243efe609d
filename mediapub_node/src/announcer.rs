//! Publishes signed collection announcements to the pub-sub topic.
//!
//! Two triggers: the sync engine's version signal (reactive) and a
//! periodic heartbeat. Heartbeats re-sign and re-send the current message
//! but never advance `version` or `timestamp` — those mark actual
//! collection changes and only the reactive path follows one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mediapub_core::{Announcement, NetClient};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::keys::KeyStore;
use crate::sync::SharedHandle;

/// Bound on a single publish call.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The sync engine completed a republish.
    Reactive,
    /// Heartbeat timer.
    Periodic,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Reactive => f.write_str("reactive"),
            Trigger::Periodic => f.write_str("periodic"),
        }
    }
}

pub struct Announcer {
    shared: SharedHandle,
    net: Arc<dyn NetClient>,
    keys: Arc<KeyStore>,
    topic: String,
    interval: Duration,
    version_rx: watch::Receiver<u64>,
}

impl Announcer {
    pub fn new(
        shared: SharedHandle,
        net: Arc<dyn NetClient>,
        keys: Arc<KeyStore>,
        topic: String,
        interval: Duration,
        version_rx: watch::Receiver<u64>,
    ) -> Self {
        Announcer {
            shared,
            net,
            keys,
            topic,
            interval,
            version_rx,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut heartbeat = tokio::time::interval_at(start, self.interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                changed = self.version_rx.changed() => match changed {
                    Ok(()) => self.announce_once(Trigger::Reactive).await,
                    Err(_) => break,
                },

                _ = heartbeat.tick() => self.announce_once(Trigger::Periodic).await,
            }
        }
        tracing::debug!("announcer stopped");
    }

    /// Composes, signs and publishes one announcement from a consistent
    /// snapshot of the shared state.
    pub async fn announce_once(&self, trigger: Trigger) {
        let (version, ipns, collection_size, timestamp) = {
            let shared = self.shared.read().await;
            let state = shared.state.get();
            (
                state.version,
                state.ipns.clone(),
                shared.index.size(),
                state.last_change_timestamp,
            )
        };

        // Receivers reject version 0 and non-positive timestamps, so there
        // is nothing useful to say before the first republish (or after an
        // upgrade from a state file that predates change timestamps).
        if version == 0 || ipns.is_empty() || timestamp <= 0 {
            tracing::debug!(%trigger, "nothing republished yet, skipping announcement");
            return;
        }

        let mut message = Announcement::new(version, ipns, collection_size, timestamp);
        if let Err(err) = message.sign(self.keys.signing_key()) {
            tracing::error!(%err, "signing announcement failed");
            return;
        }
        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(%err, "serializing announcement failed");
                return;
            }
        };

        let publish = self.net.pubsub_publish(&self.topic, payload.into());
        match tokio::time::timeout(PUBLISH_TIMEOUT, publish).await {
            Ok(Ok(())) => {
                tracing::info!(%trigger, version, collection_size, "announcement published");
            }
            Ok(Err(err)) => {
                tracing::warn!(%trigger, %err, "announcement publish failed; next trigger will retry");
            }
            Err(_) => {
                tracing::warn!(%trigger, "announcement publish timed out; next trigger will retry");
            }
        }
    }
}
