//! In-process shared state: the peer cache mirrored from (and synced to)
//! SQLite, the SSE subscriber registry, and the pieces `web.rs` needs on
//! every request. Grounded on the teacher's `SharedState` pattern in
//! `server.rs` — one struct, `Arc`'d into every handler, internals behind
//! `parking_lot::Mutex`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::db::Db;
use crate::model::{now_ms, PeerRow, PresenceMessage, RelayInfo};
use crate::presence_gate::{NoopGate, PresenceGate};
use crate::rate_limit::RateLimiter;

/// SSE fan-out caps (spec.md §4.3): 1024 subscribers total, 10 per IP.
const GLOBAL_SUBSCRIBER_CAP: usize = 1024;
const PER_IP_SUBSCRIBER_CAP: usize = 10;
/// Bounded per-subscriber channel; a full channel means a slow reader and
/// the message for them is simply dropped.
const SUBSCRIBER_BUFFER: usize = 32;

struct SseInner {
    subscribers: HashMap<u64, (IpAddr, mpsc::Sender<String>)>,
    per_ip_counts: HashMap<IpAddr, usize>,
}

pub struct SseRegistry {
    inner: Mutex<SseInner>,
    next_id: AtomicU64,
}

pub struct SseSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

impl SseRegistry {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SseInner { subscribers: HashMap::new(), per_ip_counts: HashMap::new() }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, ip: IpAddr) -> Option<SseSubscription> {
        let mut inner = self.inner.lock();
        if inner.subscribers.len() >= GLOBAL_SUBSCRIBER_CAP {
            return None;
        }
        let count = inner.per_ip_counts.entry(ip).or_insert(0);
        if *count >= PER_IP_SUBSCRIBER_CAP {
            return None;
        }
        *count += 1;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        inner.subscribers.insert(id, (ip, tx));
        Some(SseSubscription { id, rx })
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some((ip, _)) = inner.subscribers.remove(&id) {
            if let Some(count) = inner.per_ip_counts.get_mut(&ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.per_ip_counts.remove(&ip);
                }
            }
        }
    }

    /// Fans a message out to every subscriber; a full buffer means a slow
    /// subscriber and the message for them is dropped, not blocked on.
    pub fn broadcast(&self, payload: &str) {
        let inner = self.inner.lock();
        for (_, tx) in inner.subscribers.values() {
            let _ = tx.try_send(payload.to_string());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl Default for SseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SharedState {
    pub db: Option<Db>,
    peers: Mutex<HashMap<String, PeerRow>>,
    pub rate_limiter: RateLimiter,
    pub gate: Arc<dyn PresenceGate>,
    pub sse: SseRegistry,
    pub admin_password: Option<String>,
    pub relay_info: Mutex<Option<RelayInfo>>,
    snapshot_cache: Mutex<Option<String>>,
    /// Fingerprint from the last DB sync cycle (spec.md §4.3): skip a full
    /// reload when `(MAX(last_seen), COUNT(*))` hasn't changed.
    last_fingerprint: Mutex<(i64, i64)>,
    logs: Mutex<std::collections::VecDeque<LogEntry>>,
}

/// `log:<kind>` shaped entry (spec.md §7) surfaced on `/logs.json`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEntry {
    pub source: String,
    pub level: String,
    pub msg: String,
    pub ts: u64,
}

const MAX_LOG_ENTRIES: usize = 500;

impl SharedState {
    pub fn new(db: Option<Db>, admin_password: Option<String>) -> Self {
        let peers = match &db {
            Some(db) => db
                .load_all()
                .unwrap_or_default()
                .into_iter()
                .map(|r| (r.peer_id.clone(), r))
                .collect(),
            None => HashMap::new(),
        };
        Self {
            db,
            peers: Mutex::new(peers),
            rate_limiter: RateLimiter::new(),
            gate: Arc::new(NoopGate),
            sse: SseRegistry::new(),
            admin_password,
            relay_info: Mutex::new(None),
            snapshot_cache: Mutex::new(None),
            last_fingerprint: Mutex::new((0, 0)),
            logs: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn push_log(&self, source: &str, level: &str, msg: impl Into<String>) {
        let mut logs = self.logs.lock();
        if logs.len() >= MAX_LOG_ENTRIES {
            logs.pop_front();
        }
        logs.push_back(LogEntry { source: source.into(), level: level.into(), msg: msg.into(), ts: now_ms() });
    }

    pub fn logs_snapshot(&self) -> Vec<LogEntry> {
        self.logs.lock().iter().cloned().collect()
    }

    /// Applies a validated presence message: upserts (or deletes, for
    /// `offline`) the in-memory row and the DB row atomically with respect
    /// to each other, then marks the snapshot cache dirty.
    pub fn apply_presence(&self, msg: &PresenceMessage, verified_floor: bool) {
        use crate::model::PresenceType;
        if msg.kind == PresenceType::Offline {
            self.peers.lock().remove(&msg.peer_id);
            if let Some(db) = &self.db {
                let _ = db.delete(&msg.peer_id);
            }
        } else {
            let mut row = PeerRow::from_message(msg, verified_floor);
            let mut peers = self.peers.lock();
            if let Some(existing) = peers.get(&msg.peer_id) {
                row.verified = row.verified || existing.verified;
                let mut merged = existing.clone();
                merged.merge_addrs(&row.addrs);
                row.addrs = merged.addrs;
            }
            peers.insert(msg.peer_id.clone(), row.clone());
            drop(peers);
            if let Some(db) = &self.db {
                let _ = db.upsert(&row);
            }
        }
        *self.snapshot_cache.lock() = None;
    }

    /// `/peers.json` snapshot sorted online<update<offline then by
    /// `last_seen` descending (spec.md §4.3), cached until dirtied.
    pub fn peers_snapshot_json(&self) -> String {
        let mut cache = self.snapshot_cache.lock();
        if let Some(json) = cache.as_ref() {
            return json.clone();
        }
        let peers = self.peers.lock();
        let mut rows: Vec<&PeerRow> = peers.values().collect();
        rows.sort_by(|a, b| {
            a.kind.sort_rank().cmp(&b.kind.sort_rank()).then(b.last_seen_ms.cmp(&a.last_seen_ms))
        });
        let json = serde_json::to_string(&rows).unwrap_or_else(|_| "[]".into());
        *cache = Some(json.clone());
        json
    }

    /// Periodic multi-replica sync (spec.md §4.3): every 3 s, compare the
    /// DB fingerprint; reload and merge only if it changed.
    pub fn sync_from_db_if_changed(&self) {
        let Some(db) = &self.db else { return };
        let Ok(fp) = db.fingerprint() else { return };
        let mut last = self.last_fingerprint.lock();
        if *last == fp {
            return;
        }
        *last = fp;
        drop(last);

        let Ok(db_rows) = db.load_all() else { return };
        let db_ids: std::collections::HashSet<&str> = db_rows.iter().map(|r| r.peer_id.as_str()).collect();
        let mut peers = self.peers.lock();
        peers.retain(|id, _| db_ids.contains(id.as_str()));
        for row in db_rows {
            match peers.get(&row.peer_id) {
                Some(existing) if existing.last_seen_ms >= row.last_seen_ms => {}
                _ => {
                    peers.insert(row.peer_id.clone(), row);
                }
            }
        }
        drop(peers);
        *self.snapshot_cache.lock() = None;
    }

    /// Stale-peer purge (spec.md §4.3): rows older than 30 s, every 5 s.
    pub fn purge_stale(&self, max_age_ms: u64) {
        let cutoff = now_ms().saturating_sub(max_age_ms);
        self.peers.lock().retain(|_, row| row.last_seen_ms >= cutoff);
        if let Some(db) = &self.db {
            let _ = db.purge_stale(cutoff);
        }
        *self.snapshot_cache.lock() = None;
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}
