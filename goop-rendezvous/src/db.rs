//! SQLite persistence for the peer table (spec.md §4.3).
//!
//! Grounded on the teacher's `policy/store.rs`: a `parking_lot::Mutex`around
//! a single `rusqlite::Connection`, WAL journal mode, `CREATE TABLE IF NOT
//! EXISTS` migrations run once at open.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{PeerRow, PresenceType};

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open<P: AsRef<Path>>(path: P) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS peers (
                peer_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                email TEXT,
                avatar_hash TEXT,
                video_disabled INTEGER NOT NULL DEFAULT 0,
                active_template TEXT,
                addrs_json TEXT NOT NULL,
                verified INTEGER NOT NULL DEFAULT 0,
                last_seen_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_peers_last_seen ON peers(last_seen_ms);

            CREATE TABLE IF NOT EXISTS registrations (
                token TEXT PRIMARY KEY,
                peer_id TEXT NOT NULL,
                email TEXT,
                verified INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    pub fn upsert(&self, row: &PeerRow) -> rusqlite::Result<()> {
        let addrs_json = serde_json::to_string(&row.addrs).unwrap_or_else(|_| "[]".into());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO peers (peer_id, kind, content, email, avatar_hash, video_disabled,
                active_template, addrs_json, verified, last_seen_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(peer_id) DO UPDATE SET
                kind = excluded.kind,
                content = excluded.content,
                email = excluded.email,
                avatar_hash = excluded.avatar_hash,
                video_disabled = excluded.video_disabled,
                active_template = excluded.active_template,
                addrs_json = excluded.addrs_json,
                verified = CASE WHEN excluded.verified = 1 THEN 1 ELSE peers.verified END,
                last_seen_ms = excluded.last_seen_ms",
            params![
                row.peer_id,
                kind_str(row.kind),
                row.content,
                row.email,
                row.avatar_hash,
                row.video_disabled as i64,
                row.active_template,
                addrs_json,
                row.verified as i64,
                row.last_seen_ms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, peer_id: &str) -> rusqlite::Result<()> {
        self.conn.lock().execute("DELETE FROM peers WHERE peer_id = ?1", params![peer_id])?;
        Ok(())
    }

    pub fn load_all(&self) -> rusqlite::Result<Vec<PeerRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT peer_id, kind, content, email, avatar_hash, video_disabled,
                active_template, addrs_json, verified, last_seen_ms FROM peers",
        )?;
        let rows = stmt.query_map([], |r| row_from_sql(r))?;
        rows.collect()
    }

    /// `MAX(last_seen), COUNT(*)` fingerprint used by the multi-replica sync
    /// loop to skip a full reload when nothing changed (spec.md §4.3).
    pub fn fingerprint(&self) -> rusqlite::Result<(i64, i64)> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COALESCE(MAX(last_seen_ms), 0), COUNT(*) FROM peers", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
    }

    /// Deletes rows with `last_seen_ms < cutoff_ms` (spec.md §4.3 stale purge).
    pub fn purge_stale(&self, cutoff_ms: u64) -> rusqlite::Result<usize> {
        self.conn
            .lock()
            .execute("DELETE FROM peers WHERE last_seen_ms < ?1", params![cutoff_ms as i64])
    }

    pub fn insert_registration(&self, token: &str, peer_id: &str, email: Option<&str>) -> rusqlite::Result<()> {
        self.conn.lock().execute(
            "INSERT INTO registrations (token, peer_id, email, verified, created_at_ms) VALUES (?1, ?2, ?3, 0, ?4)",
            params![token, peer_id, email, crate::model::now_ms() as i64],
        )?;
        Ok(())
    }

    pub fn verify_registration(&self, token: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock();
        let peer_id: Option<String> = conn
            .query_row("SELECT peer_id FROM registrations WHERE token = ?1", params![token], |r| r.get(0))
            .optional()?;
        if let Some(ref pid) = peer_id {
            conn.execute("UPDATE registrations SET verified = 1 WHERE token = ?1", params![token])?;
            conn.execute("UPDATE peers SET verified = 1 WHERE peer_id = ?1", params![pid])?;
        }
        Ok(peer_id)
    }

    pub fn list_registrations(&self) -> rusqlite::Result<Vec<(String, String, bool)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT token, peer_id, verified FROM registrations")?;
        let rows = stmt.query_map([], |r| {
            let verified: i64 = r.get(2)?;
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, verified != 0))
        })?;
        rows.collect()
    }
}

fn kind_str(kind: PresenceType) -> &'static str {
    match kind {
        PresenceType::Online => "online",
        PresenceType::Update => "update",
        PresenceType::Offline => "offline",
    }
}

fn kind_from_str(s: &str) -> PresenceType {
    match s {
        "online" => PresenceType::Online,
        "offline" => PresenceType::Offline,
        _ => PresenceType::Update,
    }
}

fn row_from_sql(r: &rusqlite::Row) -> rusqlite::Result<PeerRow> {
    let addrs_json: String = r.get(7)?;
    let addrs: Vec<String> = serde_json::from_str(&addrs_json).unwrap_or_default();
    let kind_s: String = r.get(1)?;
    let video_disabled: i64 = r.get(5)?;
    let verified: i64 = r.get(8)?;
    let last_seen_ms: i64 = r.get(9)?;
    Ok(PeerRow {
        peer_id: r.get(0)?,
        kind: kind_from_str(&kind_s),
        content: r.get(2)?,
        email: r.get(3)?,
        avatar_hash: r.get(4)?,
        video_disabled: video_disabled != 0,
        active_template: r.get(6)?,
        addrs,
        verified: verified != 0,
        last_seen_ms: last_seen_ms as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PresenceType;

    fn row(id: &str, ts: u64) -> PeerRow {
        PeerRow {
            peer_id: id.into(),
            kind: PresenceType::Online,
            content: "test".into(),
            email: None,
            avatar_hash: None,
            video_disabled: false,
            active_template: None,
            addrs: vec!["127.0.0.1:1".into()],
            verified: false,
            last_seen_ms: ts,
        }
    }

    #[test]
    fn upsert_then_load_roundtrips() {
        let db = Db::open_memory().unwrap();
        db.upsert(&row("peer-a", 100)).unwrap();
        let rows = db.load_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].peer_id, "peer-a");
    }

    #[test]
    fn verified_is_never_downgraded_by_upsert() {
        let db = Db::open_memory().unwrap();
        let mut r = row("peer-a", 100);
        r.verified = true;
        db.upsert(&r).unwrap();
        let mut r2 = row("peer-a", 200);
        r2.verified = false;
        db.upsert(&r2).unwrap();
        let rows = db.load_all().unwrap();
        assert!(rows[0].verified);
    }

    #[test]
    fn purge_stale_removes_old_rows() {
        let db = Db::open_memory().unwrap();
        db.upsert(&row("old", 10)).unwrap();
        db.upsert(&row("new", 10_000)).unwrap();
        let removed = db.purge_stale(5_000).unwrap();
        assert_eq!(removed, 1);
        let rows = db.load_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].peer_id, "new");
    }

    #[test]
    fn registration_verify_marks_peer_verified() {
        let db = Db::open_memory().unwrap();
        db.upsert(&row("peer-a", 100)).unwrap();
        db.insert_registration("tok123", "peer-a", Some("a@example.com")).unwrap();
        let pid = db.verify_registration("tok123").unwrap();
        assert_eq!(pid.as_deref(), Some("peer-a"));
        assert!(db.load_all().unwrap()[0].verified);
    }
}
