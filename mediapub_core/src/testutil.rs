//! Test utilities: an in-memory content-network client.
//!
//! `MemoryNet` implements the full [`NetClient`] contract without any I/O.
//! Content addresses are derived deterministically from the uploaded bytes,
//! mutable names resolve instantly, and pub-sub topics fan out to in-process
//! subscribers. Failure injection covers the transient paths the daemon has
//! to survive: a fully offline network and name publishes that time out.
//!
//! # Usage
//!
//! In a consumer crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! mediapub_core = { workspace = true, features = ["testutil"] }
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::net::{
    AddOptions, ByteStream, NamePublishOptions, NameRecord, NetClient, NetError, NetResult, PubsubEvent, PubsubStream,
};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, Bytes>,
    names: HashMap<String, String>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<PubsubEvent>>>,
    published: HashMap<String, Vec<Bytes>>,
    offline: bool,
    failing_name_publishes: u32,
    add_calls: u64,
}

/// In-memory [`NetClient`] for tests.
#[derive(Clone)]
pub struct MemoryNet {
    name_handle: String,
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryNet {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNet {
    pub fn new() -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        MemoryNet {
            name_handle: format!("k51memnet{instance:04x}"),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Simulate losing / regaining network reachability.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().unwrap().offline = offline;
    }

    /// Make the next `n` calls to `publish_name` fail with a timeout,
    /// regardless of `allow_offline`.
    pub fn fail_name_publishes(&self, n: u32) {
        self.inner.lock().unwrap().failing_name_publishes = n;
    }

    /// Number of `add` calls observed so far.
    pub fn add_calls(&self) -> u64 {
        self.inner.lock().unwrap().add_calls
    }

    /// All payloads published to `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.inner
            .lock()
            .unwrap()
            .published
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Content currently stored under `address`.
    pub fn stored(&self, address: &str) -> Option<Bytes> {
        self.inner.lock().unwrap().blobs.get(address).cloned()
    }

    /// Current target of the given name handle.
    pub fn name_target(&self, name: &str) -> Option<String> {
        self.inner.lock().unwrap().names.get(name).cloned()
    }

    /// The stable name handle this instance publishes under.
    pub fn name_handle(&self) -> &str {
        &self.name_handle
    }

    fn address_for(content: &[u8]) -> String {
        // FNV-1a; enough entropy to keep distinct test payloads apart.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in content {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        format!("bafymem{:016x}{:08x}", hash, content.len() as u32)
    }
}

struct ReceiverStream(mpsc::UnboundedReceiver<PubsubEvent>);

impl futures_core::Stream for ReceiverStream {
    type Item = PubsubEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

#[async_trait]
impl NetClient for MemoryNet {
    async fn add(&self, mut reader: ByteStream, _filename: &str, _options: &AddOptions) -> NetResult<String> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.add_calls += 1;
            if inner.offline {
                return Err(NetError::Unavailable("memory net is offline".to_string()));
            }
        }

        let mut content = Vec::new();
        while let Some(chunk) = reader.next().await {
            let chunk = chunk.map_err(|e| NetError::Other(e.into()))?;
            content.extend_from_slice(&chunk);
        }

        let address = Self::address_for(&content);
        self.inner
            .lock()
            .unwrap()
            .blobs
            .insert(address.clone(), Bytes::from(content));
        Ok(address)
    }

    async fn cat(&self, address: &str) -> NetResult<ByteStream> {
        let inner = self.inner.lock().unwrap();
        if inner.offline {
            return Err(NetError::Unavailable("memory net is offline".to_string()));
        }
        let content = inner
            .blobs
            .get(address)
            .cloned()
            .ok_or_else(|| NetError::NotFound(address.to_string()))?;
        Ok(Box::new(futures::stream::iter(vec![Ok(content)])))
    }

    async fn publish_name(&self, address: &str, options: &NamePublishOptions) -> NetResult<NameRecord> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_name_publishes > 0 {
            inner.failing_name_publishes -= 1;
            return Err(NetError::Timeout(Duration::from_secs(60)));
        }
        if inner.offline && !options.allow_offline {
            return Err(NetError::Timeout(Duration::from_secs(60)));
        }
        inner.names.insert(self.name_handle.clone(), address.to_string());
        Ok(NameRecord {
            name: self.name_handle.clone(),
            target: address.to_string(),
        })
    }

    async fn resolve_name(&self, name: &str) -> NetResult<String> {
        let inner = self.inner.lock().unwrap();
        if inner.offline {
            return Err(NetError::Unavailable("memory net is offline".to_string()));
        }
        inner
            .names
            .get(name)
            .cloned()
            .ok_or_else(|| NetError::NotFound(name.to_string()))
    }

    async fn pubsub_publish(&self, topic: &str, payload: Bytes) -> NetResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.offline {
            return Err(NetError::Unavailable("memory net is offline".to_string()));
        }
        inner
            .published
            .entry(topic.to_string())
            .or_default()
            .push(payload.clone());

        if let Some(subs) = inner.subscribers.get_mut(topic) {
            subs.retain(|tx| {
                tx.send(PubsubEvent {
                    payload: payload.clone(),
                    sender: "memory".to_string(),
                })
                .is_ok()
            });
        }
        Ok(())
    }

    async fn pubsub_subscribe(&self, topic: &str) -> NetResult<PubsubStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Box::new(ReceiverStream(rx)))
    }

    async fn is_available(&self) -> NetResult<()> {
        if self.inner.lock().unwrap().offline {
            return Err(NetError::Unavailable("memory net is offline".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> NetResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(content: &'static [u8]) -> ByteStream {
        Box::new(futures::stream::iter(vec![Ok(Bytes::from_static(content))]))
    }

    #[tokio::test]
    async fn add_and_cat_roundtrip() {
        let net = MemoryNet::new();
        let addr = net
            .add(byte_stream(b"hello"), "hello.mp3", &AddOptions::default())
            .await
            .unwrap();

        let mut stream = net.cat(&addr).await.unwrap();
        let mut content = Vec::new();
        while let Some(chunk) = stream.next().await {
            content.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(content, b"hello");
        assert_eq!(net.add_calls(), 1);
    }

    #[tokio::test]
    async fn distinct_content_gets_distinct_addresses() {
        let net = MemoryNet::new();
        let a = net
            .add(byte_stream(b"aaa"), "a.mp3", &AddOptions::default())
            .await
            .unwrap();
        let b = net
            .add(byte_stream(b"bbb"), "b.mp3", &AddOptions::default())
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn name_publish_and_resolve() {
        let net = MemoryNet::new();
        let record = net
            .publish_name("bafyxyz", &NamePublishOptions::default())
            .await
            .unwrap();
        assert_eq!(record.name, net.name_handle());
        assert_eq!(net.resolve_name(&record.name).await.unwrap(), "bafyxyz");
    }

    #[tokio::test]
    async fn offline_publish_needs_allow_offline() {
        let net = MemoryNet::new();
        net.set_offline(true);

        let err = net
            .publish_name("bafyxyz", &NamePublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout(_)));

        let opts = NamePublishOptions {
            allow_offline: true,
            ..Default::default()
        };
        net.publish_name("bafyxyz", &opts).await.unwrap();
    }

    #[tokio::test]
    async fn pubsub_fans_out_to_subscribers() {
        let net = MemoryNet::new();
        let mut sub = net.pubsub_subscribe("topic").await.unwrap();

        net.pubsub_publish("topic", Bytes::from_static(b"payload")).await.unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event.payload, Bytes::from_static(b"payload"));
        assert_eq!(net.published("topic").len(), 1);
    }

    #[tokio::test]
    async fn injected_publish_failures_are_consumed() {
        let net = MemoryNet::new();
        net.fail_name_publishes(1);

        let err = net
            .publish_name("bafyxyz", &NamePublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout(_)));

        net.publish_name("bafyxyz", &NamePublishOptions::default())
            .await
            .unwrap();
    }
}
