//! Content-network client abstraction.
//!
//! `NetClient` is the only seam where the choice of transport matters: an
//! external daemon reached over HTTP, or an in-memory fake for tests. Every
//! operation the daemon performs against the network goes through this
//! trait, and callers bound the latency of individual calls with
//! `tokio::time::timeout` rather than a per-call context parameter.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;

/// A stream of byte chunks, used for both uploads and downloads.
pub type ByteStream = Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin + 'static>;

/// A stream of pub-sub messages received on a subscribed topic.
pub type PubsubStream = Box<dyn Stream<Item = PubsubEvent> + Send + Unpin + 'static>;

/// Per-file options for [`NetClient::add`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AddOptions {
    /// Keep the content pinned on the node.
    pub pin: bool,
    /// Reference the source file instead of copying it into the node's
    /// datastore (filestore mode). Only meaningful for local daemons.
    pub no_copy: bool,
    /// Chunking strategy, e.g. `size-262144`.
    pub chunker: String,
    /// Store leaf nodes as raw blocks.
    pub raw_leaves: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        AddOptions {
            pin: true,
            no_copy: false,
            chunker: "size-262144".to_string(),
            raw_leaves: true,
        }
    }
}

/// Options for [`NetClient::publish_name`].
#[derive(Debug, Clone)]
pub struct NamePublishOptions {
    /// Name of the key to publish under. `self` is the node's own key.
    pub key: String,
    /// How long the record is valid for.
    pub lifetime: Duration,
    /// Caching hint for resolvers.
    pub ttl: Duration,
    /// Accept publishing without network reachability. Used as the
    /// second-chance mode after a publish timeout.
    pub allow_offline: bool,
}

impl Default for NamePublishOptions {
    fn default() -> Self {
        NamePublishOptions {
            key: "self".to_string(),
            lifetime: Duration::from_secs(24 * 3600),
            ttl: Duration::from_secs(3600),
            allow_offline: false,
        }
    }
}

/// Result of a mutable-name publish: the stable name handle and the
/// content address it now points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRecord {
    pub name: String,
    pub target: String,
}

/// A message received from a pub-sub subscription.
#[derive(Debug, Clone)]
pub struct PubsubEvent {
    pub payload: Bytes,
    /// Textual identity of the sending peer.
    pub sender: String,
}

/// Failure modes of the content-network client.
///
/// `Unavailable` and `Timeout` are transient: callers keep the daemon
/// running and retry on a schedule. The remaining variants are terminal
/// for the operation that produced them.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum NetError {
    #[error("content network unavailable: {0}")]
    Unavailable(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("content network node is out of disk space")]
    DiskFull,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NetError {
    /// True for failures that a later retry can reasonably succeed on.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::Unavailable(_) | NetError::Timeout(_))
    }
}

pub type NetResult<T> = Result<T, NetError>;

/// Operations the daemon consumes from the content network.
///
/// Implementations must be internally thread-safe: the sync engine calls
/// `add` and `publish_name` while the announcer concurrently calls
/// `pubsub_publish`.
#[async_trait]
pub trait NetClient: Send + Sync + 'static {
    /// Streams `reader` into the network under the logical name `filename`
    /// and returns the resulting content address.
    async fn add(&self, reader: ByteStream, filename: &str, options: &AddOptions) -> NetResult<String>;

    /// Opens the content behind `address` for streaming reads.
    async fn cat(&self, address: &str) -> NetResult<ByteStream>;

    /// Binds the caller's mutable name to `address`.
    async fn publish_name(&self, address: &str, options: &NamePublishOptions) -> NetResult<NameRecord>;

    /// Resolves a name handle to the content address it currently points at.
    async fn resolve_name(&self, name: &str) -> NetResult<String>;

    /// Publishes `payload` to the given pub-sub topic.
    async fn pubsub_publish(&self, topic: &str, payload: Bytes) -> NetResult<()>;

    /// Subscribes to a pub-sub topic.
    async fn pubsub_subscribe(&self, topic: &str) -> NetResult<PubsubStream>;

    /// Cheap liveness probe; `Ok(())` when the network node is reachable.
    async fn is_available(&self) -> NetResult<()>;

    /// Releases any resources held by the client.
    async fn close(&self) -> NetResult<()>;
}
