//! Durable per-peer cache of last-known peer metadata (spec.md §4.1).
//!
//! Grounded directly on the teacher's `db.rs`: a `rusqlite::Connection` in
//! WAL mode, upserts via `ON CONFLICT DO UPDATE`, and in-memory round-trip
//! tests using `Connection::open_in_memory()`.

use std::path::Path;

use rusqlite::{params, Connection};

use crate::error::GoopResult;
use crate::peer::Peer;

pub struct CachedPeerStore {
    conn: Connection,
}

impl CachedPeerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> GoopResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn open_memory() -> GoopResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> GoopResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cached_peers (
                peer_id         TEXT PRIMARY KEY,
                content         TEXT NOT NULL,
                email           TEXT,
                avatar_hash     TEXT,
                video_disabled  INTEGER NOT NULL DEFAULT 0,
                active_template TEXT,
                verified        INTEGER NOT NULL DEFAULT 0,
                addrs_json      TEXT NOT NULL DEFAULT '[]',
                protocols_json  TEXT NOT NULL DEFAULT '[]',
                favorite        INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }

    pub fn save(&self, peer: &Peer) -> GoopResult<()> {
        let addrs_json = serde_json::to_string(&peer.addrs).unwrap_or_else(|_| "[]".into());
        let protocols_json =
            serde_json::to_string(&peer.protocols).unwrap_or_else(|_| "[]".into());
        self.conn.execute(
            "INSERT INTO cached_peers
                (peer_id, content, email, avatar_hash, video_disabled, active_template, verified, addrs_json, protocols_json, favorite)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(peer_id) DO UPDATE SET
                content=excluded.content,
                email=excluded.email,
                avatar_hash=excluded.avatar_hash,
                video_disabled=excluded.video_disabled,
                active_template=excluded.active_template,
                verified=excluded.verified,
                addrs_json=excluded.addrs_json,
                protocols_json=excluded.protocols_json,
                favorite=excluded.favorite",
            params![
                peer.peer_id,
                peer.content,
                peer.email,
                peer.avatar_hash,
                peer.video_disabled as i32,
                peer.active_template,
                peer.verified as i32,
                addrs_json,
                protocols_json,
                peer.favorite as i32,
            ],
        )?;
        Ok(())
    }

    /// Refresh just the protocol list for a peer, called on every identify
    /// completion per spec.md §4.1.
    pub fn update_protocols(&self, peer_id: &str, protocols: &std::collections::BTreeSet<String>) -> GoopResult<()> {
        let protocols_json = serde_json::to_string(protocols).unwrap_or_else(|_| "[]".into());
        self.conn.execute(
            "UPDATE cached_peers SET protocols_json = ?1 WHERE peer_id = ?2",
            params![protocols_json, peer_id],
        )?;
        Ok(())
    }

    pub fn delete(&self, peer_id: &str) -> GoopResult<()> {
        self.conn
            .execute("DELETE FROM cached_peers WHERE peer_id = ?1", params![peer_id])?;
        Ok(())
    }

    pub fn load_all(&self) -> GoopResult<Vec<Peer>> {
        let mut stmt = self.conn.prepare(
            "SELECT peer_id, content, email, avatar_hash, video_disabled, active_template, verified, addrs_json, protocols_json, favorite
             FROM cached_peers",
        )?;
        let rows = stmt.query_map([], |row| {
            let addrs_json: String = row.get(7)?;
            let protocols_json: String = row.get(8)?;
            let addrs: Vec<String> = serde_json::from_str(&addrs_json).unwrap_or_default();
            let protocols: std::collections::BTreeSet<String> =
                serde_json::from_str(&protocols_json).unwrap_or_default();
            Ok(Peer {
                peer_id: row.get(0)?,
                content: row.get(1)?,
                email: row.get(2)?,
                avatar_hash: row.get(3)?,
                video_disabled: row.get::<_, i32>(4)? != 0,
                active_template: row.get(5)?,
                protocols,
                verified: row.get::<_, i32>(6)? != 0,
                addrs,
                reachable: false,
                last_seen: std::time::Instant::now(),
                offline_since: None,
                favorite: row.get::<_, i32>(9)? != 0,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_peer(id: &str) -> Peer {
        Peer {
            peer_id: id.to_string(),
            content: "alice".to_string(),
            email: Some("a@example.com".to_string()),
            avatar_hash: None,
            video_disabled: false,
            active_template: Some("default".to_string()),
            addrs: vec!["/ip4/1.2.3.4/udp/1".to_string()],
            protocols: ["/goop/mq/1.0.0".to_string()].into_iter().collect(),
            verified: true,
            reachable: false,
            last_seen: std::time::Instant::now(),
            offline_since: None,
            favorite: true,
        }
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let store = CachedPeerStore::open_memory().unwrap();
        store.save(&mk_peer("a")).unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "alice");
        assert!(all[0].verified);
        assert!(all[0].favorite);
        assert_eq!(all[0].protocols.len(), 1);
    }

    #[test]
    fn delete_removes_row() {
        let store = CachedPeerStore::open_memory().unwrap();
        store.save(&mk_peer("a")).unwrap();
        store.delete("a").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn update_protocols_only_touches_that_column() {
        let store = CachedPeerStore::open_memory().unwrap();
        store.save(&mk_peer("a")).unwrap();
        let mut protos = std::collections::BTreeSet::new();
        protos.insert("/goop/listen/1.0.0".to_string());
        store.update_protocols("a", &protos).unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all[0].protocols, protos);
        assert_eq!(all[0].content, "alice");
    }
}
