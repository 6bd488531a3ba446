//! In-memory peer index with change-event fan-out (spec.md §4.1).
//!
//! Grounded on the teacher's `server.rs::ChannelState` pattern: shared
//! mutable state behind a single lock, with edge-triggered notifications
//! rather than re-broadcasting unconditionally (`db.rs`'s round-trip test
//! style is mirrored in this module's `#[cfg(test)]` block).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::peer::Peer;

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Update { peer_id: String, peer: Box<Peer> },
    Remove { peer_id: String },
}

/// Default bounded capacity for the peer-table event channel. Slow
/// subscribers lag and miss old events rather than stalling the table.
const EVENT_CAPACITY: usize = 256;

pub struct PeerTable {
    inner: Mutex<HashMap<String, Peer>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(HashMap::new()),
            events: tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Insert or update a peer. `verified` is only ever raised here when the
    /// caller is the rendezvous client path — gossip-sourced callers must
    /// pass `verified: None` to avoid downgrading an already-verified peer.
    pub fn upsert(&self, mut incoming: Peer, verified: Option<bool>) {
        let mut table = self.inner.lock();
        let changed;
        match table.get_mut(&incoming.peer_id) {
            Some(existing) => {
                let merged_addrs = {
                    let mut a = existing.addrs.clone();
                    for addr in &incoming.addrs {
                        if !a.contains(addr) {
                            a.push(addr.clone());
                        }
                    }
                    a
                };
                changed = existing.content != incoming.content
                    || existing.email != incoming.email
                    || existing.avatar_hash != incoming.avatar_hash
                    || existing.video_disabled != incoming.video_disabled
                    || existing.active_template != incoming.active_template
                    || existing.addrs != merged_addrs;

                existing.content = incoming.content.clone();
                existing.email = incoming.email.clone();
                existing.avatar_hash = incoming.avatar_hash.clone();
                existing.video_disabled = incoming.video_disabled;
                existing.active_template = incoming.active_template.clone();
                existing.addrs = merged_addrs;
                existing.last_seen = Instant::now();
                existing.offline_since = None;
                // verified is never downgraded by gossip (verified: None).
                if let Some(v) = verified {
                    existing.verified = existing.verified || v;
                }
            }
            None => {
                incoming.verified = verified.unwrap_or(false);
                incoming.last_seen = Instant::now();
                table.insert(incoming.peer_id.clone(), incoming.clone());
                changed = true;
            }
        }
        if changed {
            if let Some(peer) = table.get(&incoming.peer_id).cloned() {
                let _ = self.events.send(PeerEvent::Update {
                    peer_id: incoming.peer_id,
                    peer: Box::new(peer),
                });
            }
        }
    }

    /// Restore a peer from the cached-peer store on startup (spec.md §4.1 `Seed`).
    pub fn seed(&self, peer: Peer) {
        let mut table = self.inner.lock();
        table.entry(peer.peer_id.clone()).or_insert(peer);
    }

    pub fn mark_offline(&self, peer_id: &str) {
        let mut table = self.inner.lock();
        if let Some(p) = table.get_mut(peer_id) {
            p.reachable = false;
            p.offline_since = Some(Instant::now());
        }
    }

    pub fn set_reachable(&self, peer_id: &str, reachable: bool) {
        let mut table = self.inner.lock();
        if let Some(p) = table.get_mut(peer_id) {
            if p.reachable != reachable {
                p.reachable = reachable;
                if reachable {
                    p.offline_since = None;
                }
            }
        }
    }

    pub fn set_favorite(&self, peer_id: &str, favorite: bool) {
        let mut table = self.inner.lock();
        if let Some(p) = table.get_mut(peer_id) {
            p.favorite = favorite;
        }
    }

    pub fn set_protocols(&self, peer_id: &str, protocols: std::collections::BTreeSet<String>) {
        let mut table = self.inner.lock();
        if let Some(p) = table.get_mut(peer_id) {
            p.protocols = protocols;
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.inner.lock().get(peer_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.inner.lock().values().cloned().collect()
    }

    /// Remove entries whose `last_seen < ttl_cutoff` are soft-expired
    /// (reachable is simply left false); entries additionally satisfying
    /// `offline_since < grace_cutoff` and not favorited are hard-deleted.
    /// Returns the peer_ids that were hard-deleted, for the caller to fan
    /// out a `peer:gone` event.
    pub fn prune_stale(&self, ttl: Duration, grace: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut table = self.inner.lock();
        let mut removed = Vec::new();
        table.retain(|peer_id, peer| {
            if peer.last_seen.elapsed() < ttl {
                return true;
            }
            peer.reachable = false;
            let grace_expired = peer
                .offline_since
                .map(|since| now.duration_since(since) >= grace)
                .unwrap_or(true);
            if grace_expired && !peer.favorite {
                removed.push(peer_id.clone());
                false
            } else {
                true
            }
        });
        drop(table);
        for id in &removed {
            let _ = self.events.send(PeerEvent::Remove { peer_id: id.clone() });
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PresenceMessage;

    fn mk_peer(id: &str) -> Peer {
        let msg = PresenceMessage {
            kind: crate::peer::PresenceType::Online,
            peer_id: id.to_string(),
            content: "hello".to_string(),
            email: None,
            avatar_hash: None,
            video_disabled: false,
            active_template: None,
            addrs: vec!["/ip4/1.2.3.4/udp/4001".to_string()],
            ts: PresenceMessage::now_ms(),
        };
        Peer::from_presence(&msg, false)
    }

    #[test]
    fn upsert_merges_addrs_without_replacing() {
        let table = PeerTable::new();
        table.upsert(mk_peer("a"), None);
        let mut second = mk_peer("a");
        second.addrs = vec!["/ip4/5.6.7.8/udp/4001".to_string()];
        table.upsert(second, None);
        let p = table.get("a").unwrap();
        assert_eq!(p.addrs.len(), 2);
    }

    #[test]
    fn gossip_never_downgrades_verified() {
        let table = PeerTable::new();
        let mut p = mk_peer("a");
        p.verified = false;
        table.upsert(p, Some(true));
        assert!(table.get("a").unwrap().verified);
        table.upsert(mk_peer("a"), None);
        assert!(table.get("a").unwrap().verified);
    }

    #[test]
    fn edge_triggered_event_emission() {
        let table = PeerTable::new();
        let mut rx = table.subscribe();
        table.upsert(mk_peer("a"), None);
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Update { .. }));
        // Same content again: no new event.
        table.upsert(mk_peer("a"), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn prune_stale_respects_favorite_and_grace() {
        let table = PeerTable::new();
        table.upsert(mk_peer("a"), None);
        table.set_favorite("a", true);
        table.mark_offline("a");
        // TTL of zero makes everyone stale immediately.
        let removed = table.prune_stale(Duration::from_secs(0), Duration::from_secs(3600));
        assert!(removed.is_empty(), "favorited peer should survive within grace");
        assert!(table.get("a").is_some());
    }

    #[test]
    fn prune_stale_deletes_non_favorite_past_grace() {
        let table = PeerTable::new();
        table.upsert(mk_peer("a"), None);
        table.mark_offline("a");
        let removed = table.prune_stale(Duration::from_secs(0), Duration::from_secs(0));
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(table.get("a").is_none());
    }
}
