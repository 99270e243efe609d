//! [`NetClient`] implementation for an external content-network daemon
//! reached over its HTTP RPC API.
//!
//! All endpoints live under `/api/v0/` and take POST requests with
//! query-string arguments. Uploads and pub-sub payloads travel as
//! multipart bodies; pub-sub topics are multibase-encoded (`u` prefix,
//! unpadded URL-safe base64) as the API requires. Connection failures map
//! to `Unavailable` and elapsed client timeouts to `Timeout`, which is
//! what the daemon's retry scheduling keys on.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use mediapub_core::{
    AddOptions, ByteStream, NamePublishOptions, NameRecord, NetClient, NetError, NetResult, PubsubEvent,
    net::PubsubStream,
};
use serde::Deserialize;

/// Client for one daemon API endpoint.
#[derive(Debug, Clone)]
pub struct HttpNet {
    api_base: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct NamePublishResponse {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct NameResolveResponse {
    #[serde(rename = "Path")]
    path: String,
}

#[derive(Debug, Deserialize)]
struct PubsubMessage {
    #[serde(default)]
    from: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Message", default)]
    message: String,
}

impl HttpNet {
    /// Creates a client for the daemon at `api_url`, e.g.
    /// `http://127.0.0.1:5001`. `timeout` bounds every request.
    pub fn new(api_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpNet {
            api_base: format!("{}/api/v0", api_url.trim_end_matches('/')),
            timeout,
            http,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.api_base)
    }

    fn map_error(&self, err: reqwest::Error) -> NetError {
        if err.is_timeout() {
            NetError::Timeout(self.timeout)
        } else if err.is_connect() {
            NetError::Unavailable(err.to_string())
        } else {
            NetError::Other(err.into())
        }
    }

    /// Classifies an API-level error reply by its message text; the API
    /// reports everything as HTTP 500 with a JSON body.
    fn map_api_error(status: reqwest::StatusCode, body: &[u8]) -> NetError {
        let message = serde_json::from_slice::<ErrorResponse>(body)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
        let lower = message.to_lowercase();

        if lower.contains("no space left") || lower.contains("disk full") {
            NetError::DiskFull
        } else if lower.contains("not found")
            || lower.contains("could not resolve")
            || lower.contains("no link named")
        {
            NetError::NotFound(message)
        } else {
            NetError::Other(anyhow::anyhow!("api error (status {status}): {message}"))
        }
    }

    async fn check(&self, response: reqwest::Response) -> NetResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(Self::map_api_error(status, &body))
    }

    /// Multibase form of a topic name, as the pub-sub endpoints expect.
    fn multibase_topic(topic: &str) -> String {
        format!("u{}", URL_SAFE_NO_PAD.encode(topic.as_bytes()))
    }

    fn format_duration(d: Duration) -> String {
        format!("{}s", d.as_secs())
    }
}

#[async_trait]
impl NetClient for HttpNet {
    async fn add(&self, reader: ByteStream, filename: &str, options: &AddOptions) -> NetResult<String> {
        let body = reqwest::Body::wrap_stream(reader);
        let part = reqwest::multipart::Part::stream(body)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| NetError::Other(e.into()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(self.url("add"))
            .query(&[
                ("pin", options.pin.to_string()),
                ("nocopy", options.no_copy.to_string()),
                ("chunker", options.chunker.clone()),
                ("raw-leaves", options.raw_leaves.to_string()),
            ])
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let response = self.check(response).await?;

        let parsed: AddResponse = response.json().await.map_err(|e| self.map_error(e))?;
        Ok(parsed.hash)
    }

    async fn cat(&self, address: &str) -> NetResult<ByteStream> {
        let response = self
            .http
            .post(self.url("cat"))
            .query(&[("arg", address)])
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let response = self.check(response).await?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(Box::pin(stream)))
    }

    async fn publish_name(&self, address: &str, options: &NamePublishOptions) -> NetResult<NameRecord> {
        let response = self
            .http
            .post(self.url("name/publish"))
            .query(&[
                ("arg", format!("/ipfs/{address}")),
                ("key", options.key.clone()),
                ("lifetime", Self::format_duration(options.lifetime)),
                ("ttl", Self::format_duration(options.ttl)),
                ("allow-offline", options.allow_offline.to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let response = self.check(response).await?;

        let parsed: NamePublishResponse = response.json().await.map_err(|e| self.map_error(e))?;
        Ok(NameRecord {
            name: parsed.name,
            target: parsed.value,
        })
    }

    async fn resolve_name(&self, name: &str) -> NetResult<String> {
        let response = self
            .http
            .post(self.url("name/resolve"))
            .query(&[("arg", name)])
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let response = self.check(response).await?;

        let parsed: NameResolveResponse = response.json().await.map_err(|e| self.map_error(e))?;
        Ok(parsed.path)
    }

    async fn pubsub_publish(&self, topic: &str, payload: Bytes) -> NetResult<()> {
        let part = reqwest::multipart::Part::bytes(payload.to_vec()).file_name("data");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(self.url("pubsub/pub"))
            .query(&[("arg", Self::multibase_topic(topic))])
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.check(response).await?;
        Ok(())
    }

    async fn pubsub_subscribe(&self, topic: &str) -> NetResult<PubsubStream> {
        // The subscription never completes server-side, so it must not be
        // subject to the per-request timeout.
        let response = self
            .http
            .post(self.url("pubsub/sub"))
            .query(&[("arg", Self::multibase_topic(topic))])
            .timeout(Duration::from_secs(u64::MAX / 4))
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let response = self.check(response).await?;

        Ok(Box::new(NdjsonEvents::new(response.bytes_stream().boxed())))
    }

    async fn is_available(&self) -> NetResult<()> {
        let response = self
            .http
            .post(self.url("id"))
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        self.check(response).await?;
        Ok(())
    }

    async fn close(&self) -> NetResult<()> {
        // Connection pooling is dropped with the client.
        Ok(())
    }
}

/// Adapter from the API's streaming newline-delimited JSON messages to
/// [`PubsubEvent`]s. Malformed lines are dropped with a warning.
struct NdjsonEvents<S> {
    inner: S,
    buffer: BytesMut,
    done: bool,
}

impl<S> NdjsonEvents<S> {
    fn new(inner: S) -> Self {
        NdjsonEvents {
            inner,
            buffer: BytesMut::new(),
            done: false,
        }
    }

    fn next_line(&mut self) -> Option<Bytes> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let line = self.buffer.split_to(pos + 1);
        Some(line.freeze())
    }
}

/// Decodes one newline-delimited subscription message. Malformed lines
/// yield `None` and are dropped with a warning.
fn decode_pubsub_line(line: &[u8]) -> Option<PubsubEvent> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    if line.is_empty() {
        return None;
    }
    let message: PubsubMessage = match serde_json::from_slice(line) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(%err, "dropping malformed pubsub message");
            return None;
        }
    };
    let payload = match message.data.strip_prefix('u') {
        Some(encoded) => match URL_SAFE_NO_PAD.decode(encoded) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                tracing::warn!(%err, "dropping pubsub message with invalid payload encoding");
                return None;
            }
        },
        None => Bytes::copy_from_slice(message.data.as_bytes()),
    };
    Some(PubsubEvent {
        payload,
        sender: message.from,
    })
}

impl<S, E> Stream for NdjsonEvents<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = PubsubEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(line) = self.next_line()
                && let Some(event) = decode_pubsub_line(&line)
            {
                return Poll::Ready(Some(event));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(err))) => {
                    tracing::warn!(%err, "pubsub subscription stream error");
                    self.done = true;
                }
                Poll::Ready(None) => self.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_multibase_encoding() {
        // "mdn/collections/announce" in unpadded url-safe base64, with the
        // multibase prefix.
        let encoded = HttpNet::multibase_topic("mdn/collections/announce");
        assert!(encoded.starts_with('u'));
        let decoded = URL_SAFE_NO_PAD.decode(&encoded[1..]).unwrap();
        assert_eq!(decoded, b"mdn/collections/announce");
    }

    #[test]
    fn api_errors_are_classified() {
        let status = reqwest::StatusCode::INTERNAL_SERVER_ERROR;

        let err = HttpNet::map_api_error(status, br#"{"Message":"no space left on device"}"#);
        assert!(matches!(err, NetError::DiskFull));

        let err = HttpNet::map_api_error(status, br#"{"Message":"could not resolve name"}"#);
        assert!(matches!(err, NetError::NotFound(_)));

        let err = HttpNet::map_api_error(status, br#"{"Message":"something else broke"}"#);
        assert!(matches!(err, NetError::Other(_)));

        // Non-JSON bodies still classify.
        let err = HttpNet::map_api_error(status, b"merkledag: not found");
        assert!(matches!(err, NetError::NotFound(_)));
    }

    #[test]
    fn ndjson_lines_decode_to_events() {
        let payload = URL_SAFE_NO_PAD.encode(b"hello subscribers");
        let line = format!(r#"{{"from":"12D3peer","data":"u{payload}"}}"#);

        let event = decode_pubsub_line(line.as_bytes()).unwrap();
        assert_eq!(event.payload, Bytes::from_static(b"hello subscribers"));
        assert_eq!(event.sender, "12D3peer");
    }

    #[test]
    fn malformed_ndjson_lines_are_dropped() {
        assert!(decode_pubsub_line(b"not json").is_none());
        assert!(decode_pubsub_line(b"").is_none());
    }

    #[tokio::test]
    async fn ndjson_stream_splits_chunks_on_newlines() {
        let payload_a = URL_SAFE_NO_PAD.encode(b"aaa");
        let payload_b = URL_SAFE_NO_PAD.encode(b"bbb");
        let raw = format!(
            "{{\"from\":\"p1\",\"data\":\"u{payload_a}\"}}\n{{\"from\":\"p2\",\"data\":\"u{payload_b}\"}}\n"
        );
        // Split mid-line to exercise buffering.
        let (first, second) = raw.split_at(10);
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::copy_from_slice(first.as_bytes())),
            Ok(Bytes::copy_from_slice(second.as_bytes())),
        ];

        let mut events = NdjsonEvents::new(futures::stream::iter(chunks));
        let a = events.next().await.unwrap();
        assert_eq!(a.payload, Bytes::from_static(b"aaa"));
        let b = events.next().await.unwrap();
        assert_eq!(b.payload, Bytes::from_static(b"bbb"));
        assert!(events.next().await.is_none());
    }

    #[test]
    fn url_building_tolerates_trailing_slash() {
        let net = HttpNet::new("http://127.0.0.1:5001/", Duration::from_secs(5)).unwrap();
        assert_eq!(net.url("add"), "http://127.0.0.1:5001/api/v0/add");
    }
}
