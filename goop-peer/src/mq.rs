//! Process-wide pub/sub bus (spec.md §4.5).
//!
//! Grounded on the teacher's `server.rs` broadcast-channel fan-out for
//! per-channel message delivery: bounded `tokio::sync::broadcast` per
//! subscription, lossy under backpressure rather than blocking the
//! publisher. Topic routing (exact + prefix) has no teacher counterpart —
//! it's built directly from spec.md §3's "fan-out rule: a subscription with
//! prefix `P` matches all topics whose string-prefix is `P`" using a
//! straightforward `Vec` of registered matchers, since the number of live
//! subscriptions in one process is small.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{GoopError, GoopResult, LogEvent, LogLevel};
use crate::node::{P2pNode, PROTO_MQ};
use crate::peer::PresenceType;
use crate::peer_table::{PeerEvent, PeerTable};

const SUBSCRIBER_BUFFER: usize = 64;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// `{from, topic, payload}` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub topic: String,
    pub payload: serde_json::Value,
}

struct Subscription {
    id: u64,
    topic: String,
    prefix: bool,
    tx: mpsc::Sender<Envelope>,
}

pub struct Cancel {
    id: u64,
    bus: Arc<MqInner>,
}

impl Drop for Cancel {
    fn drop(&mut self) {
        self.bus.subscriptions.lock().retain(|s| s.id != self.id);
    }
}

struct MqInner {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: std::sync::atomic::AtomicU64,
}

pub struct MqManager {
    inner: Arc<MqInner>,
    node: Arc<P2pNode>,
    peer_table: Arc<PeerTable>,
    local_peer_id: String,
}

impl MqManager {
    pub fn new(node: Arc<P2pNode>, peer_table: Arc<PeerTable>, local_peer_id: String) -> Arc<Self> {
        let inner = Arc::new(MqInner {
            subscriptions: Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
        });
        let mgr = Arc::new(Self { inner, node, peer_table, local_peer_id });
        mgr.clone().spawn_peer_announce_bridge();
        mgr
    }

    /// Exact-topic subscription. Returns a receiver and a `Cancel` guard;
    /// dropping the guard (or calling nothing further) unsubscribes.
    pub fn subscribe(&self, topic: &str) -> (mpsc::Receiver<Envelope>, Cancel) {
        self.register(topic, false)
    }

    /// Prefix subscription: matches any topic whose string-prefix is
    /// `prefix`. Callers parse the remaining suffix themselves.
    pub fn subscribe_topic(&self, prefix: &str) -> (mpsc::Receiver<Envelope>, Cancel) {
        self.register(prefix, true)
    }

    fn register(&self, topic: &str, prefix: bool) -> (mpsc::Receiver<Envelope>, Cancel) {
        let id = self.inner.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.subscriptions.lock().push(Subscription { id, topic: topic.to_string(), prefix, tx });
        (rx, Cancel { id, bus: self.inner.clone() })
    }

    /// Fire-and-forget local delivery. Never blocks: a full subscriber
    /// buffer just drops this message for that subscriber.
    pub fn publish_local(&self, topic: &str, from: &str, payload: serde_json::Value) {
        let envelope = Envelope { from: from.to_string(), topic: topic.to_string(), payload };
        let subs = self.inner.subscriptions.lock();
        for sub in subs.iter() {
            let matches = if sub.prefix { topic.starts_with(&sub.topic) } else { topic == sub.topic };
            if matches {
                let _ = sub.tx.try_send(envelope.clone());
            }
        }
    }

    pub fn publish_log(&self, source: &str, level: LogLevel, msg: impl Into<String>) {
        let event = LogEvent { source: source.to_string(), level, msg: msg.into(), ts: crate::peer::PresenceMessage::now_ms() };
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        self.publish_local(&format!("log:{source}"), &self.local_peer_id, payload);
    }

    /// Deliver `payload` under `topic` to a specific remote peer over the
    /// MQ stream protocol. Short-circuits with `UnsupportedByPeer` if the
    /// cached protocol list doesn't include `/goop/mq/1.0.0`, avoiding a
    /// doomed dial.
    pub async fn send(&self, peer_id: &str, topic: &str, payload: serde_json::Value) -> GoopResult<()> {
        if let Some(peer) = self.peer_table.get(peer_id) {
            if !peer.protocols.is_empty() && !peer.protocols.contains("/goop/mq/1.0.0") {
                return Err(GoopError::UnsupportedByPeer("/goop/mq/1.0.0".into()));
            }
        }
        let envelope = Envelope { from: self.local_peer_id.clone(), topic: topic.to_string(), payload };
        let fut = self.send_inner(peer_id, &envelope);
        tokio::time::timeout(SEND_TIMEOUT, fut)
            .await
            .map_err(|_| GoopError::Timeout(SEND_TIMEOUT))?
    }

    async fn send_inner(&self, peer_id: &str, envelope: &Envelope) -> GoopResult<()> {
        use tokio::io::AsyncWriteExt;
        let (mut send, _recv) = self.node.open_stream(peer_id, PROTO_MQ).await?;
        let bytes = serde_json::to_vec(envelope).map_err(|e| GoopError::ProtocolError(e.to_string()))?;
        send.write_all(&bytes).await?;
        send.write_all(b"\n").await?;
        send.finish().map_err(|e| GoopError::Unreachable(format!("finish: {e}")))?;
        Ok(())
    }

    /// Registered as the `/goop/mq/1.0.0` stream handler: decodes one
    /// newline-delimited JSON envelope and republishes it locally.
    /// Malformed envelopes are dropped with a warning, never torn down.
    pub async fn handle_inbound_stream(&self, recv: iroh::endpoint::RecvStream) {
        use tokio::io::AsyncReadExt;
        let mut reader = tokio::io::BufReader::new(recv);
        let mut buf = Vec::new();
        if let Err(e) = tokio::io::AsyncBufReadExt::read_until(&mut reader, b'\n', &mut buf).await {
            tracing::warn!("mq stream read failed: {e}");
            return;
        }
        match serde_json::from_slice::<Envelope>(&buf) {
            Ok(envelope) => self.publish_local(&envelope.topic.clone(), &envelope.from.clone(), envelope.payload),
            Err(e) => tracing::warn!("dropped malformed mq envelope: {e}"),
        }
    }

    pub fn publish_peer_announce(&self, peer_id: &str, presence: &PresenceType) {
        let payload = serde_json::json!({ "peer_id": peer_id, "type": format!("{presence:?}").to_lowercase() });
        self.publish_local("peer:announce", &self.local_peer_id, payload);
    }

    pub fn publish_peer_gone(&self, peer_id: &str) {
        let payload = serde_json::json!({ "peer_id": peer_id });
        self.publish_local("peer:gone", &self.local_peer_id, payload);
    }

    /// Bridges peer-table events onto `peer:announce`/`peer:gone` topics
    /// (spec.md §4.5). Spawned once from `new`.
    fn spawn_peer_announce_bridge(self: Arc<Self>) {
        let mut rx = self.peer_table.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PeerEvent::Update { peer_id, .. }) => {
                        self.publish_peer_announce(&peer_id, &PresenceType::Update);
                    }
                    Ok(PeerEvent::Remove { peer_id }) => {
                        self.publish_peer_gone(&peer_id);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Helper for call sessions and other consumers that want only topics under
/// a fixed `channel` prefix, parsing the suffix themselves.
pub fn topic_suffix(prefix: &str, topic: &str) -> Option<String> {
    topic.strip_prefix(prefix).map(|s| s.to_string())
}

#[allow(dead_code)]
fn _known_topic_prefixes() -> BTreeSet<&'static str> {
    ["call:", "listen:", "log:", "peer:", "group:"].into_iter().collect()
}
