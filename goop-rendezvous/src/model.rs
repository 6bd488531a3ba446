//! Wire types shared with `goop-peer` (spec.md §3). Duplicated rather than
//! imported — the rendezvous has no dependency on the peer runtime crate —
//! but kept byte-for-byte compatible on the JSON wire.

use serde::{Deserialize, Serialize};

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
    /// Sort rank for `/peers.json` (spec.md §4.3): online < update < offline.
    pub fn sort_rank(self) -> u8 {
        match self {
            PresenceType::Online => 0,
            PresenceType::Update => 1,
            PresenceType::Offline => 2,
        }
    }
}

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
    /// Set by the rendezvous on read; never trusted from the wire.
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{0}")]
    Invalid(String),
}

impl PresenceMessage {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.peer_id.is_empty() || self.peer_id.len() > MAX_PEER_ID_LEN {
            return Err(ValidationError::Invalid(format!(
                "peer_id length {} out of bounds",
                self.peer_id.len()
            )));
        }
        if self.content.len() > MAX_CONTENT_LEN {
            return Err(ValidationError::Invalid(format!(
                "content length {} exceeds {MAX_CONTENT_LEN}",
                self.content.len()
            )));
        }
        if self.addrs.len() > MAX_ADDRS {
            return Err(ValidationError::Invalid(format!(
                "addrs count {} exceeds {MAX_ADDRS}",
                self.addrs.len()
            )));
        }
        for a in &self.addrs {
            if a.len() > MAX_ADDR_LEN {
                return Err(ValidationError::Invalid(format!(
                    "addr length {} exceeds {MAX_ADDR_LEN}",
                    a.len()
                )));
            }
        }
        Ok(())
    }
}

/// A persisted peer row (spec.md §4.3 SQLite store).
#[derive(Debug, Clone, Serialize)]
pub struct PeerRow {
    pub peer_id: String,
    pub kind: PresenceType,
    pub content: String,
    pub email: Option<String>,
    pub avatar_hash: Option<String>,
    pub video_disabled: bool,
    pub active_template: Option<String>,
    pub addrs: Vec<String>,
    pub verified: bool,
    pub last_seen_ms: u64,
}

impl PeerRow {
    pub fn from_message(msg: &PresenceMessage, verified: bool) -> Self {
        Self {
            peer_id: msg.peer_id.clone(),
            kind: msg.kind,
            content: msg.content.clone(),
            email: msg.email.clone(),
            avatar_hash: msg.avatar_hash.clone(),
            video_disabled: msg.video_disabled,
            active_template: msg.active_template.clone(),
            addrs: msg.addrs.clone(),
            verified,
            last_seen_ms: msg.ts,
        }
    }

    /// Append-merge addrs: never partially replaced (spec.md §3 invariant).
    pub fn merge_addrs(&mut self, new_addrs: &[String]) {
        for a in new_addrs {
            if !self.addrs.contains(a) {
                self.addrs.push(a.clone());
            }
        }
    }
}

/// Response shape of `GET /relay` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    pub peer_id: String,
    pub addrs: Vec<String>,
    pub cleanup_delay_s: u64,
    pub poll_deadline_s: u64,
    pub connect_timeout_s: u64,
    pub refresh_interval_s: u64,
    pub recovery_grace_s: u64,
}

pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
