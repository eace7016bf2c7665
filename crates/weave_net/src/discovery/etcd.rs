//! etcd v3 backend over the gRPC-gateway JSON API.
//!
//! Keys and values travel base64-encoded and int64 fields come back as
//! strings, per the gateway's JSON mapping. Watches use the streaming
//! `/v3/watch` endpoint, which answers with one JSON object per line.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{DiscoveryBackend, LeaseId, WatchEvent};
use crate::error::NetError;

pub struct EtcdBackend {
    endpoints: Vec<String>,
    current: AtomicUsize,
    client: reqwest::Client,
    /// No overall timeout; watch responses stay open indefinitely.
    watch_client: reqwest::Client,
}

impl EtcdBackend {
    pub fn new(endpoints: Vec<String>, request_timeout: Duration) -> Result<Self, NetError> {
        if endpoints.is_empty() {
            return Err(NetError::Discovery("no etcd endpoints configured".into()));
        }
        let endpoints = endpoints
            .into_iter()
            .map(|ep| normalize_endpoint(&ep))
            .collect();
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NetError::Discovery(format!("HTTP client: {e}")))?;
        let watch_client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| NetError::Discovery(format!("HTTP client: {e}")))?;
        Ok(Self {
            endpoints,
            current: AtomicUsize::new(0),
            client,
            watch_client,
        })
    }

    /// POST `body` to `path`, failing over across endpoints on transport
    /// errors. The endpoint that answered becomes the preferred one.
    async fn call<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, NetError> {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_err = None;
        for i in 0..self.endpoints.len() {
            let idx = (start + i) % self.endpoints.len();
            let url = format!("{}{path}", self.endpoints[idx]);
            match self.client.post(&url).json(&body).send().await {
                Ok(resp) => {
                    self.current.store(idx, Ordering::Relaxed);
                    return parse_response(resp).await;
                }
                Err(e) => {
                    debug!(url, "etcd request failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(NetError::Discovery(format!(
            "all etcd endpoints failed: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn grant(&self, ttl: Duration) -> Result<LeaseId, NetError> {
        let resp: LeaseGrantResponse = self
            .call("/v3/lease/grant", json!({ "TTL": ttl.as_secs().max(1) }))
            .await?;
        if !resp.error.is_empty() {
            return Err(NetError::Discovery(format!("lease grant: {}", resp.error)));
        }
        Ok(resp.id)
    }
}

fn normalize_endpoint(ep: &str) -> String {
    let ep = ep.trim_end_matches('/');
    if ep.starts_with("http://") || ep.starts_with("https://") {
        ep.to_string()
    } else {
        format!("http://{ep}")
    }
}

async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, NetError> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| NetError::Discovery(format!("etcd response body: {e}")))?;
    if !status.is_success() {
        return Err(NetError::Discovery(format!("etcd error: {status} - {text}")));
    }
    serde_json::from_str(&text).map_err(|e| NetError::Discovery(format!("etcd response: {e}")))
}

fn b64(s: &str) -> String {
    STANDARD.encode(s.as_bytes())
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xFF: range to the end of the keyspace.
    vec![0]
}

fn range_request(prefix: &str) -> Value {
    json!({
        "key": b64(prefix),
        "range_end": STANDARD.encode(prefix_end(prefix)),
    })
}

// -- gateway JSON shapes ------------------------------------------------------

fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }
    match IntOrString::deserialize(d)? {
        IntOrString::Int(n) => Ok(n),
        IntOrString::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "de_i64")]
    id: i64,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResponse {
    #[serde(default)]
    result: Option<KeepAliveResult>,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Debug, Deserialize, Serialize)]
struct KeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

impl KeyValue {
    fn decode(&self) -> Result<(String, Vec<u8>), NetError> {
        let key = STANDARD
            .decode(&self.key)
            .map_err(|e| NetError::Discovery(format!("bad key encoding: {e}")))?;
        let value = STANDARD
            .decode(&self.value)
            .map_err(|e| NetError::Discovery(format!("bad value encoding: {e}")))?;
        Ok((String::from_utf8_lossy(&key).into_owned(), value))
    }
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct WatchLine {
    #[serde(default)]
    result: Option<WatchResult>,
}

#[derive(Debug, Deserialize)]
struct WatchResult {
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    events: Vec<RawWatchEvent>,
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    /// Omitted for PUT, the enum's zero value.
    #[serde(rename = "type", default)]
    kind: String,
    kv: KeyValue,
}

impl RawWatchEvent {
    fn into_event(self) -> Result<WatchEvent, NetError> {
        let (key, value) = self.kv.decode()?;
        Ok(match self.kind.as_str() {
            "DELETE" => WatchEvent::Delete { key },
            _ => WatchEvent::Put { key, value },
        })
    }
}

/// Split complete lines off the front of `buf`, leaving any partial line.
/// Lines are decoded only once whole, so a multi-byte character split
/// across chunks survives.
fn drain_lines(buf: &mut BytesMut) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line = buf.split_to(pos + 1);
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if !text.is_empty() {
            lines.push(text.to_string());
        }
    }
    lines
}

/// Parse one line of the watch stream. `Ok(None)` means the server
/// cancelled the watch.
fn parse_watch_line(line: &str) -> Result<Option<Vec<WatchEvent>>, NetError> {
    let parsed: WatchLine = serde_json::from_str(line)?;
    let Some(result) = parsed.result else {
        return Ok(Some(Vec::new()));
    };
    if result.canceled {
        return Ok(None);
    }
    result
        .events
        .into_iter()
        .map(RawWatchEvent::into_event)
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

#[async_trait]
impl DiscoveryBackend for EtcdBackend {
    async fn register(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<LeaseId, NetError> {
        let lease = self.grant(ttl).await?;
        let _: Value = self
            .call(
                "/v3/kv/put",
                json!({
                    "key": b64(key),
                    "value": STANDARD.encode(&value),
                    "lease": lease.to_string(),
                }),
            )
            .await?;
        debug!(key, lease, "Registered under lease");
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), NetError> {
        let resp: KeepAliveResponse = self
            .call("/v3/lease/keepalive", json!({ "ID": lease.to_string() }))
            .await?;
        match resp.result {
            Some(result) if result.ttl > 0 => Ok(()),
            _ => Err(NetError::Discovery(format!("lease {lease} expired"))),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), NetError> {
        let _: Value = self
            .call("/v3/lease/revoke", json!({ "ID": lease.to_string() }))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), NetError> {
        let _: Value = self
            .call("/v3/kv/deleterange", json!({ "key": b64(key) }))
            .await?;
        Ok(())
    }

    async fn get(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, NetError> {
        let resp: RangeResponse = self.call("/v3/kv/range", range_request(prefix)).await?;
        resp.kvs.iter().map(KeyValue::decode).collect()
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>, NetError> {
        let idx = self.current.load(Ordering::Relaxed) % self.endpoints.len();
        let url = format!("{}/v3/watch", self.endpoints[idx]);
        let resp = self
            .watch_client
            .post(&url)
            .json(&json!({ "create_request": range_request(prefix) }))
            .send()
            .await
            .map_err(|e| NetError::Discovery(format!("watch request: {e}")))?;
        if !resp.status().is_success() {
            return Err(NetError::Discovery(format!("watch rejected: {}", resp.status())));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            use futures::StreamExt;

            let mut stream = resp.bytes_stream();
            let mut buffer = BytesMut::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(prefix, "etcd watch stream error: {e}");
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);

                for line in drain_lines(&mut buffer) {
                    match parse_watch_line(&line) {
                        Ok(Some(events)) => {
                            for event in events {
                                if tx.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            warn!(prefix, "etcd cancelled the watch");
                            return;
                        }
                        Err(e) => debug!("Skipping malformed watch line: {e}"),
                    }
                }
            }
            debug!(prefix, "etcd watch stream ended");
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
