//! Synchronized listen room manager: state machine, control broadcast, and
//! sync pulse (spec.md §4.7).
//!
//! Grounded on the teacher's ticker-driven broadcast loop in `server.rs`
//! (a periodic timer driving a fan-out to all connected clients) and its
//! JSON persistence pattern from `db.rs`, applied here to
//! `listen-queue.json` via `queue::ListenState::save`.

pub mod queue;
pub mod serve;
pub mod stream;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{GoopError, GoopResult};
use crate::group::GroupManager;
use crate::listen::queue::{ListenState, QueueEntry};
use crate::node::P2pNode;

const SYNC_PULSE_EVERY_TICKS: u32 = 10;
const TICK_INTERVAL: Duration = Duration::from_millis(500);
pub const LATE_JOINER_CATCHUP_SECS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    None,
    Hosting,
    Listener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Paused,
    Playing,
    Disconnected,
    Closed,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Load,
    Play,
    Pause,
    Seek,
    Sync,
    Close,
}

/// Control message broadcast to group members (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<QueueEntry>,
    pub position: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_types: Option<Vec<String>>,
    pub queue_index: usize,
    pub queue_total: usize,
}

struct Session {
    mode: Mode,
    playback: PlaybackState,
    state: ListenState,
    tick_count: u32,
}

pub struct ListenManager {
    node: Arc<P2pNode>,
    groups: Arc<GroupManager>,
    queue_path: PathBuf,
    local_peer_id: String,
    session: RwLock<Option<Session>>,
    control_tx: broadcast::Sender<ControlMessage>,
    member_peers: RwLock<Vec<String>>,
}

impl ListenManager {
    pub fn new(node: Arc<P2pNode>, groups: Arc<GroupManager>, queue_path: PathBuf, local_peer_id: String) -> Arc<Self> {
        let (control_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            node,
            groups,
            queue_path,
            local_peer_id,
            session: RwLock::new(None),
            control_tx,
            member_peers: RwLock::new(Vec::new()),
        })
    }

    pub fn subscribe_control(&self) -> broadcast::Receiver<ControlMessage> {
        self.control_tx.subscribe()
    }

    /// A listen manager holds at most one active group at a time; joining
    /// a new one while already a listener automatically leaves the
    /// previous (spec.md §3 invariant).
    pub fn create_group(&self, name: &str) -> GoopResult<String> {
        self.leave_if_active();
        let group_id = format!("listen-{}", ulid_like());
        self.groups.create_group(&group_id, name, "listen", 0, false)?;
        self.groups.join_own_group(&group_id)?;
        let mut session = self.session.write();
        *session = Some(Session {
            mode: Mode::Hosting,
            playback: PlaybackState::Paused,
            state: ListenState::new(group_id.clone()),
            tick_count: 0,
        });
        Ok(group_id)
    }

    pub fn load_queue(&self, paths: Vec<String>) -> GoopResult<()> {
        self.with_hosting_session(|s| {
            s.state.queue = paths.iter().map(|p| probe_entry(p)).collect();
            s.state.queue_index = 0;
            s.state.position = 0.0;
            s.state.touch();
            Ok(())
        })?;
        self.persist()?;
        self.broadcast_load();
        Ok(())
    }

    pub fn add_to_queue(&self, paths: Vec<String>) -> GoopResult<()> {
        self.with_hosting_session(|s| {
            s.state.queue.extend(paths.iter().map(|p| probe_entry(p)));
            s.state.touch();
            Ok(())
        })?;
        self.persist()
    }

    pub fn play(&self) -> GoopResult<()> {
        self.with_hosting_session(|s| {
            s.playback = PlaybackState::Playing;
            s.state.paused = false;
            s.state.touch();
            Ok(())
        })?;
        self.persist()?;
        self.broadcast_control(ControlAction::Play);
        Ok(())
    }

    pub fn pause(&self) -> GoopResult<()> {
        self.with_hosting_session(|s| {
            s.playback = PlaybackState::Paused;
            s.state.paused = true;
            s.state.touch();
            Ok(())
        })?;
        self.persist()?;
        self.broadcast_control(ControlAction::Pause);
        Ok(())
    }

    pub fn seek(&self, pos: f64) -> GoopResult<()> {
        self.with_hosting_session(|s| {
            s.state.position = pos;
            s.state.seek_generation += 1;
            s.state.touch();
            Ok(())
        })?;
        self.persist()?;
        self.broadcast_control(ControlAction::Seek);
        Ok(())
    }

    pub fn next(&self) -> GoopResult<()> {
        self.with_hosting_session(|s| {
            if s.state.queue_index + 1 < s.state.queue.len() {
                s.state.queue_index += 1;
            }
            s.state.position = 0.0;
            s.state.touch();
            Ok(())
        })?;
        self.persist()?;
        self.broadcast_load();
        Ok(())
    }

    pub fn prev(&self) -> GoopResult<()> {
        self.with_hosting_session(|s| {
            s.state.queue_index = s.state.queue_index.saturating_sub(1);
            s.state.position = 0.0;
            s.state.touch();
            Ok(())
        })?;
        self.persist()?;
        self.broadcast_load();
        Ok(())
    }

    pub fn skip_to_track(&self, i: usize) -> GoopResult<()> {
        self.with_hosting_session(|s| {
            if i >= s.state.queue.len() {
                return Err(GoopError::Validation(format!("track index {i} out of range")));
            }
            s.state.queue_index = i;
            s.state.position = 0.0;
            s.state.touch();
            Ok(())
        })?;
        self.persist()?;
        self.broadcast_load();
        Ok(())
    }

    pub fn remove_from_queue(&self, i: usize) -> GoopResult<()> {
        self.with_hosting_session(|s| {
            if i >= s.state.queue.len() {
                return Err(GoopError::Validation(format!("track index {i} out of range")));
            }
            s.state.queue.remove(i);
            if s.state.queue_index >= i && s.state.queue_index > 0 {
                s.state.queue_index -= 1;
            }
            s.state.touch();
            Ok(())
        })?;
        self.persist()
    }

    pub fn close_group(&self) -> GoopResult<()> {
        let group_id = {
            let mut session = self.session.write();
            let s = session.take().ok_or_else(|| GoopError::NotFound("no active listen session".into()))?;
            s.state.group_id
        };
        self.groups.close_group(&group_id)?;
        let _ = self.control_tx.send(ControlMessage {
            action: ControlAction::Close,
            track: None,
            position: 0.0,
            queue: None,
            queue_types: None,
            queue_index: 0,
            queue_total: 0,
        });
        Ok(())
    }

    pub async fn join_group(&self, host: &str, group_id: &str) -> GoopResult<()> {
        self.leave_if_active();
        let (welcome, _rx) = self.groups.join_remote_group(host, group_id).await?;
        let _ = welcome;
        let mut session = self.session.write();
        *session = Some(Session {
            mode: Mode::Listener,
            playback: PlaybackState::Paused,
            state: ListenState::new(group_id.to_string()),
            tick_count: 0,
        });
        Ok(())
    }

    pub fn leave_group(&self) -> GoopResult<()> {
        let group_id = {
            let session = self.session.read();
            session.as_ref().map(|s| s.state.group_id.clone())
        };
        if let Some(id) = group_id {
            let _ = self.groups.leave_group(&id);
        }
        *self.session.write() = None;
        Ok(())
    }

    /// Opens the raw audio stream for the active listener session.
    pub async fn audio_reader(&self) -> GoopResult<(stream::StreamHeader, impl tokio::io::AsyncRead + Unpin)> {
        let (host, group_id) = {
            let session = self.session.read();
            let s = session.as_ref().ok_or_else(|| GoopError::NotFound("not listening".into()))?;
            if s.mode != Mode::Listener {
                return Err(GoopError::Forbidden("not a listener session".into()));
            }
            let host = self
                .groups
                .host_peer_for(&s.state.group_id)
                .ok_or_else(|| GoopError::NotFound("no host peer for active listen subscription".into()))?;
            (host, s.state.group_id.clone())
        };
        stream::request_listen_stream(&self.node, &host, &group_id).await
    }

    /// Host-side lookup used by `serve::serve_audio_request`: the entry
    /// currently loaded for `group_id`, if this manager is hosting it.
    pub(crate) fn current_entry_for(&self, group_id: &str) -> Option<QueueEntry> {
        let session = self.session.read();
        let s = session.as_ref()?;
        if s.mode != Mode::Hosting || s.state.group_id != group_id {
            return None;
        }
        s.state.queue.get(s.state.queue_index).cloned()
    }

    /// Stop-condition check for an in-flight audio stream (spec.md §4.7:
    /// "paused, group closed, or group ID mismatch").
    pub(crate) fn still_streaming(&self, group_id: &str) -> bool {
        let session = self.session.read();
        match session.as_ref() {
            Some(s) => s.mode == Mode::Hosting && s.state.group_id == group_id && s.playback == PlaybackState::Playing,
            None => false,
        }
    }

    fn leave_if_active(&self) {
        let had_session = self.session.read().is_some();
        if had_session {
            let _ = self.leave_group();
        }
    }

    fn with_hosting_session<F>(&self, f: F) -> GoopResult<()>
    where
        F: FnOnce(&mut Session) -> GoopResult<()>,
    {
        let mut session = self.session.write();
        let s = session.as_mut().ok_or_else(|| GoopError::NotFound("no active listen session".into()))?;
        if s.mode != Mode::Hosting {
            return Err(GoopError::Forbidden("not hosting".into()));
        }
        f(s)
    }

    fn persist(&self) -> GoopResult<()> {
        let session = self.session.read();
        if let Some(s) = session.as_ref() {
            s.state.save(&self.queue_path)?;
        }
        Ok(())
    }

    fn broadcast_load(&self) {
        let session = self.session.read();
        if let Some(s) = session.as_ref() {
            let track = s.state.queue.get(s.state.queue_index).cloned();
            let msg = ControlMessage {
                action: ControlAction::Load,
                track,
                position: s.state.position,
                queue: Some(s.state.queue.iter().map(|e| e.path.clone()).collect()),
                queue_types: Some(s.state.queue.iter().map(|e| format!("{:?}", e.kind).to_lowercase()).collect()),
                queue_index: s.state.queue_index,
                queue_total: s.state.queue.len(),
            };
            let group_id = s.state.group_id.clone();
            drop(session);
            self.fan_out(&group_id, &msg);
        }
    }

    fn broadcast_control(&self, action: ControlAction) {
        let session = self.session.read();
        if let Some(s) = session.as_ref() {
            let msg = ControlMessage {
                action,
                track: s.state.queue.get(s.state.queue_index).cloned(),
                position: s.state.position,
                queue: None,
                queue_types: None,
                queue_index: s.state.queue_index,
                queue_total: s.state.queue.len(),
            };
            let group_id = s.state.group_id.clone();
            drop(session);
            self.fan_out(&group_id, &msg);
        }
    }

    /// Publishes a control message to local subscribers (`subscribe_control`,
    /// e.g. a viewer UI in this same process) and fans it out to remote
    /// group members over the wire (spec.md §4.7's `Play`/`Pause`/`Seek`/
    /// `Next`/`load`/`sync` reaching every listener, not just this process).
    fn fan_out(&self, group_id: &str, msg: &ControlMessage) {
        let _ = self.control_tx.send(msg.clone());
        let payload = serde_json::to_value(msg).unwrap_or_default();
        if let Err(e) = self.groups.send_to_group_as_host(group_id, payload) {
            tracing::debug!(group_id, "control broadcast fan-out skipped: {e}");
        }
    }

    /// On startup, reload the saved queue/index/group id and re-join the
    /// own group; falls back to index 0 if probing the saved track fails
    /// (spec.md §4.7 persistence).
    pub async fn restore_from_disk(self: &Arc<Self>) -> GoopResult<()> {
        let Some(mut state) = ListenState::load(&self.queue_path)? else {
            return Ok(());
        };
        if state.queue_index >= state.queue.len() {
            state.queue_index = 0;
        }
        self.groups.create_group(&state.group_id, &state.group_id, "listen", 0, false).ok();
        self.groups.join_own_group(&state.group_id)?;
        *self.session.write() = Some(Session { mode: Mode::Hosting, playback: PlaybackState::Paused, state, tick_count: 0 });
        Ok(())
    }

    /// Notes which peers are currently in the hosted group, used to detect
    /// late joiners for catch-up re-sync.
    pub fn note_members(&self, members: Vec<String>) {
        let mut prior = self.member_peers.write();
        let new_arrivals: Vec<String> = members.iter().filter(|m| !prior.contains(m)).cloned().collect();
        *prior = members;
        drop(prior);
        if !new_arrivals.is_empty() {
            // Late joiner sync: re-broadcast load then play/pause with the
            // current computed position (spec.md §4.7).
            self.broadcast_load();
            let session = self.session.read();
            if let Some(s) = session.as_ref() {
                let action = if s.playback == PlaybackState::Playing { ControlAction::Play } else { ControlAction::Pause };
                drop(session);
                self.broadcast_control(action);
            }
        }
    }

    /// 500ms ticker driving the sync pulse every 10 ticks (spec.md §4.7).
    pub fn spawn_ticker(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                let mut session = self.session.write();
                let Some(s) = session.as_mut() else { continue };
                if s.mode != Mode::Hosting || s.playback != PlaybackState::Playing {
                    continue;
                }
                s.state.position += TICK_INTERVAL.as_secs_f64();
                s.tick_count += 1;
                let due = s.tick_count >= SYNC_PULSE_EVERY_TICKS;
                if due {
                    s.tick_count = 0;
                }
                drop(session);
                if due {
                    self.broadcast_control(ControlAction::Sync);
                }
            }
        });
    }
}

fn probe_entry(path: &str) -> QueueEntry {
    if path.starts_with("http://") || path.starts_with("https://") {
        queue::stream_entry(path)
    } else {
        queue::probe_file(path).unwrap_or_else(|_| queue::stream_entry(path))
    }
}

fn ulid_like() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16).map(|_| rng.sample(rand::distributions::Alphanumeric) as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_action_serializes_lowercase() {
        let json = serde_json::to_string(&ControlAction::Sync).unwrap();
        assert_eq!(json, "\"sync\"");
    }
}
