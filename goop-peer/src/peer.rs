//! Peer and presence data model (spec.md §3).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{GoopError, GoopResult};

pub const MAX_PEER_ID_LEN: usize = 256;
pub const MAX_CONTENT_LEN: usize = 4096;
pub const MAX_ADDRS: usize = 20;
pub const MAX_ADDR_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceType {
    Online,
    Update,
    Offline,
}

impl PresenceType {
    /// Sort rank used by `/peers.json` per spec.md §4.3: online < update < offline.
    pub fn sort_rank(self) -> u8 {
        match self {
            PresenceType::Online => 0,
            PresenceType::Update => 1,
            PresenceType::Offline => 2,
        }
    }
}

/// `{type, peer_id, content, email, avatar_hash, video_disabled,
/// active_template, addrs, ts}` from spec.md §3. Immutable per instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMessage {
    #[serde(rename = "type")]
    pub kind: PresenceType,
    pub peer_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_hash: Option<String>,
    #[serde(default)]
    pub video_disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_template: Option<String>,
    #[serde(default)]
    pub addrs: Vec<String>,
    pub ts: u64,
}

impl PresenceMessage {
    pub fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Validates the bounds from spec.md §3: peer_id ≤ 256, content ≤ 4096,
    /// addrs ≤ 20, each addr ≤ 256.
    pub fn validate(&self) -> GoopResult<()> {
        if self.peer_id.is_empty() || self.peer_id.len() > MAX_PEER_ID_LEN {
            return Err(GoopError::Validation(format!(
                "peer_id length {} out of bounds",
                self.peer_id.len()
            )));
        }
        if self.content.len() > MAX_CONTENT_LEN {
            return Err(GoopError::Validation(format!(
                "content length {} exceeds {MAX_CONTENT_LEN}",
                self.content.len()
            )));
        }
        if self.addrs.len() > MAX_ADDRS {
            return Err(GoopError::Validation(format!(
                "addrs count {} exceeds {MAX_ADDRS}",
                self.addrs.len()
            )));
        }
        for a in &self.addrs {
            if a.len() > MAX_ADDR_LEN {
                return Err(GoopError::Validation(format!(
                    "addr length {} exceeds {MAX_ADDR_LEN}",
                    a.len()
                )));
            }
        }
        Ok(())
    }
}

/// In-memory representation of a known peer (spec.md §3).
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: String,
    pub content: String,
    pub email: Option<String>,
    pub avatar_hash: Option<String>,
    pub video_disabled: bool,
    pub active_template: Option<String>,
    pub addrs: Vec<String>,
    pub protocols: std::collections::BTreeSet<String>,
    /// Set only by the rendezvous; never downgraded by P2P gossip.
    pub verified: bool,
    pub reachable: bool,
    pub last_seen: std::time::Instant,
    pub offline_since: Option<std::time::Instant>,
    pub favorite: bool,
}

impl Peer {
    pub fn from_presence(msg: &PresenceMessage, verified: bool) -> Self {
        Self {
            peer_id: msg.peer_id.clone(),
            content: msg.content.clone(),
            email: msg.email.clone(),
            avatar_hash: msg.avatar_hash.clone(),
            video_disabled: msg.video_disabled,
            active_template: msg.active_template.clone(),
            addrs: msg.addrs.clone(),
            protocols: Default::default(),
            verified,
            reachable: false,
            last_seen: std::time::Instant::now(),
            offline_since: None,
            favorite: false,
        }
    }

    /// Append-merge addrs (spec.md §3 invariant: never partially replaced).
    pub fn merge_addrs(&mut self, new_addrs: &[String]) {
        for a in new_addrs {
            if !self.addrs.contains(a) {
                self.addrs.push(a.clone());
            }
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.last_seen.elapsed() >= ttl
    }
}
