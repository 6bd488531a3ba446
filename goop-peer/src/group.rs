//! Group protocol: host/member session management over
//! `/goop/group/1.0.0` (spec.md §4.6).
//!
//! Grounded on the teacher's `event.rs`/`client.rs` split between a typed
//! wire enum and a manager that owns per-channel dispatch, with `app_type`
//! handler registration modeled on the teacher's IRC command-table
//! dispatch in `server.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::{GoopError, GoopResult};
use crate::node::{P2pNode, PROTO_GROUP};

/// `{type, group, from, payload}` newline-delimited JSON (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub group: String,
    pub from: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Join,
    Welcome,
    Members,
    Msg,
    State,
    Leave,
    Close,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub members: Vec<String>,
    pub group_name: String,
    pub app_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Sent to every connected member whenever hosted-group membership changes,
/// so late joiners (and the host's own registered handler) can re-sync
/// (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersPayload {
    pub members: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
    pub app_type: String,
    pub max_members: u32,
    pub invite_only: bool,
    pub host_peer_id: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Member,
}

/// `{host_peer_id, group_id, role, subscribed_at}`, restored across
/// restarts (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub host_peer_id: String,
    pub group_id: String,
    pub role: SubscriptionRole,
    pub subscribed_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionRole {
    Host,
    Member,
}

/// Invoked once per inbound event for groups whose `app_type` has a
/// registered handler (spec.md §4.6). Unhandled events route through MQ
/// under `group:<gid>:*` instead.
pub type GroupEventHandler = Arc<dyn Fn(GroupEnvelope) + Send + Sync>;

struct HostedGroup {
    info: GroupInfo,
    members: Vec<String>,
    member_tx: HashMap<String, mpsc::Sender<GroupEnvelope>>,
}

struct RemoteSubscription {
    sub: Subscription,
    tx: mpsc::Sender<GroupEnvelope>,
}

pub struct GroupManager {
    node: Arc<P2pNode>,
    local_peer_id: String,
    mq: Arc<crate::mq::MqManager>,
    hosted: RwLock<HashMap<String, HostedGroup>>,
    remote: RwLock<HashMap<String, RemoteSubscription>>,
    handlers: RwLock<HashMap<String, GroupEventHandler>>,
}

impl GroupManager {
    pub fn new(node: Arc<P2pNode>, local_peer_id: String, mq: Arc<crate::mq::MqManager>) -> Arc<Self> {
        Arc::new(Self {
            node,
            local_peer_id,
            mq,
            hosted: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        })
    }

    pub fn register_handler(&self, app_type: &str, handler: GroupEventHandler) {
        self.handlers.write().insert(app_type.to_string(), handler);
    }

    pub fn create_group(
        &self,
        id: &str,
        name: &str,
        app_type: &str,
        max_members: u32,
        invite_only: bool,
    ) -> GoopResult<()> {
        let mut hosted = self.hosted.write();
        if hosted.contains_key(id) {
            return Err(GoopError::Conflict(format!("group {id} already hosted")));
        }
        let info = GroupInfo {
            id: id.to_string(),
            name: name.to_string(),
            app_type: app_type.to_string(),
            max_members,
            invite_only,
            host_peer_id: self.local_peer_id.clone(),
            created_at: crate::peer::PresenceMessage::now_ms(),
        };
        hosted.insert(id.to_string(), HostedGroup { info, members: Vec::new(), member_tx: HashMap::new() });
        Ok(())
    }

    pub fn close_group(&self, id: &str) -> GoopResult<()> {
        let group = self
            .hosted
            .write()
            .remove(id)
            .ok_or_else(|| GoopError::NotFound(format!("hosted group {id}")))?;
        for (peer, tx) in group.member_tx {
            let _ = tx.try_send(GroupEnvelope {
                kind: EnvelopeKind::Close,
                group: id.to_string(),
                from: self.local_peer_id.clone(),
                payload: serde_json::Value::Null,
            });
            drop(peer);
        }
        Ok(())
    }

    pub fn list_hosted_groups(&self) -> Vec<GroupInfo> {
        self.hosted.read().values().map(|g| g.info.clone()).collect()
    }

    pub fn send_to_group_as_host(&self, id: &str, payload: serde_json::Value) -> GoopResult<()> {
        let hosted = self.hosted.read();
        let group = hosted.get(id).ok_or_else(|| GoopError::NotFound(format!("hosted group {id}")))?;
        let envelope = GroupEnvelope {
            kind: EnvelopeKind::Msg,
            group: id.to_string(),
            from: self.local_peer_id.clone(),
            payload,
        };
        for tx in group.member_tx.values() {
            let _ = tx.try_send(envelope.clone());
        }
        Ok(())
    }

    /// Hosts implicitly count as members of their own group (spec.md §3).
    pub fn join_own_group(&self, id: &str) -> GoopResult<Vec<String>> {
        let mut hosted = self.hosted.write();
        let group = hosted.get_mut(id).ok_or_else(|| GoopError::NotFound(format!("hosted group {id}")))?;
        if !group.members.contains(&self.local_peer_id) {
            group.members.push(self.local_peer_id.clone());
        }
        Ok(group.members.clone())
    }

    /// Opens a stream to `host_peer`, sends `join`, and awaits the
    /// `welcome`. On success registers a remote subscription so a restart
    /// can replay it.
    pub async fn join_remote_group(
        &self,
        host_peer: &str,
        id: &str,
    ) -> GoopResult<(WelcomePayload, mpsc::Receiver<GroupEnvelope>)> {
        let (mut send, recv) = self.node.open_stream(host_peer, PROTO_GROUP).await?;
        let join = GroupEnvelope {
            kind: EnvelopeKind::Join,
            group: id.to_string(),
            from: self.local_peer_id.clone(),
            payload: serde_json::Value::Null,
        };
        write_envelope(&mut send, &join).await?;

        let mut reader = BufReader::new(recv);
        let welcome_env = read_envelope(&mut reader).await?;
        if welcome_env.kind != EnvelopeKind::Welcome {
            return Err(GoopError::ProtocolError(format!("expected welcome, got {:?}", welcome_env.kind)));
        }
        let welcome: WelcomePayload = serde_json::from_value(welcome_env.payload)
            .map_err(|e| GoopError::ProtocolError(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        self.remote.write().insert(
            id.to_string(),
            RemoteSubscription {
                sub: Subscription {
                    host_peer_id: host_peer.to_string(),
                    group_id: id.to_string(),
                    role: SubscriptionRole::Member,
                    subscribed_at: crate::peer::PresenceMessage::now_ms(),
                },
                tx: tx.clone(),
            },
        );

        // Resolved once up front: the app_type a subscription talks is fixed
        // for its lifetime, so there is no need to re-look-up the handler
        // table per envelope.
        let handler = self.handlers.read().get(&welcome.app_type).cloned();
        let mq = self.mq.clone();
        tokio::spawn(async move {
            loop {
                match read_envelope(&mut reader).await {
                    Ok(env) => {
                        run_dispatch(&handler, &mq, env.clone());
                        if tx.send(env).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok((welcome, rx))
    }

    /// The host peer id backing a remote subscription, if one is active.
    /// Lets consumers like the listen manager dial the host without
    /// duplicating subscription bookkeeping.
    pub fn host_peer_for(&self, group_id: &str) -> Option<String> {
        self.remote.read().get(group_id).map(|r| r.sub.host_peer_id.clone())
    }

    pub fn leave_group(&self, id: &str) -> GoopResult<()> {
        self.remote
            .write()
            .remove(id)
            .ok_or_else(|| GoopError::NotFound(format!("remote subscription {id}")))?;
        Ok(())
    }

    pub async fn send_to_group(&self, id: &str, payload: serde_json::Value) -> GoopResult<()> {
        let host_peer = {
            let remote = self.remote.read();
            let sub = remote.get(id).ok_or_else(|| GoopError::NotFound(format!("remote subscription {id}")))?;
            sub.sub.host_peer_id.clone()
        };
        let envelope = GroupEnvelope { kind: EnvelopeKind::Msg, group: id.to_string(), from: self.local_peer_id.clone(), payload };
        self.mq.send(&host_peer, &format!("group:{id}:msg"), serde_json::to_value(&envelope).unwrap_or_default()).await
    }

    /// Replays persisted subscriptions on startup (spec.md §4.6 reconnect
    /// semantics): opens a fresh stream per subscription and synthesizes a
    /// `welcome` once the handshake completes. If the registered handler
    /// has no live session for this group, it must restore a stub state —
    /// that auto-restore hook lives on `HandleGroupEvent`, not here.
    pub async fn replay_subscriptions(&self, persisted: Vec<Subscription>) {
        for sub in persisted {
            if sub.role != SubscriptionRole::Member {
                continue;
            }
            match self.join_remote_group(&sub.host_peer_id, &sub.group_id).await {
                Ok(_) => tracing::info!(group = %sub.group_id, "resubscribed after restart"),
                Err(e) => tracing::warn!(group = %sub.group_id, "failed to resubscribe: {e}"),
            }
        }
    }

    /// Server-side accept handler for `/goop/group/1.0.0`: reads `join`,
    /// registers the member, replies `welcome`, and then forwards every
    /// subsequent message the host sends to this member.
    pub async fn handle_inbound_stream(
        self: &Arc<Self>,
        mut send: iroh::endpoint::SendStream,
        recv: iroh::endpoint::RecvStream,
    ) -> GoopResult<()> {
        let mut reader = BufReader::new(recv);
        let join = read_envelope(&mut reader).await?;
        if join.kind != EnvelopeKind::Join {
            return Err(GoopError::ProtocolError(format!("expected join, got {:?}", join.kind)));
        }
        let group_id = join.group.clone();
        let member = join.from.clone();

        let (welcome, app_type) = {
            let mut hosted = self.hosted.write();
            let group = hosted
                .get_mut(&group_id)
                .ok_or_else(|| GoopError::NotFound(format!("group {group_id}")))?;
            if group.members.len() as u32 >= group.max_members && group.max_members > 0 {
                return Err(GoopError::Forbidden("group full".into()));
            }
            if !group.members.contains(&member) {
                group.members.push(member.clone());
            }
            (group.members.clone(), group.info.app_type.clone())
        };

        let welcome_payload = WelcomePayload { members: welcome, group_name: group_id.clone(), app_type: app_type.clone(), state: None };
        let welcome_env = GroupEnvelope {
            kind: EnvelopeKind::Welcome,
            group: group_id.clone(),
            from: self.local_peer_id.clone(),
            payload: serde_json::to_value(&welcome_payload).unwrap_or_default(),
        };
        write_envelope(&mut send, &welcome_env).await?;

        let (tx, mut rx) = mpsc::channel(64);
        self.hosted.write().get_mut(&group_id).map(|g| g.member_tx.insert(member.clone(), tx));
        self.notify_members(&group_id, &app_type);

        while let Some(env) = rx.recv().await {
            if write_envelope(&mut send, &env).await.is_err() {
                break;
            }
        }
        if let Some(group) = self.hosted.write().get_mut(&group_id) {
            group.member_tx.remove(&member);
            group.members.retain(|m| m != &member);
        }
        self.notify_members(&group_id, &app_type);
        Ok(())
    }

    /// Builds the current membership list for `group_id` and both (a)
    /// dispatches it to the host's own registered handler for `app_type`
    /// (spec.md §4.7's late-joiner re-sync relies on `ListenManager`
    /// receiving this locally) and (b) fans it out over the wire to every
    /// already-connected member, so remote listeners re-sync too.
    fn notify_members(&self, group_id: &str, app_type: &str) {
        let members = match self.hosted.read().get(group_id) {
            Some(group) => group.members.clone(),
            None => return,
        };
        let env = GroupEnvelope {
            kind: EnvelopeKind::Members,
            group: group_id.to_string(),
            from: self.local_peer_id.clone(),
            payload: serde_json::to_value(&MembersPayload { members }).unwrap_or_default(),
        };
        self.dispatch_or_publish(app_type, env.clone());
        if let Some(group) = self.hosted.read().get(group_id) {
            for tx in group.member_tx.values() {
                let _ = tx.try_send(env.clone());
            }
        }
    }

    /// Invokes the handler registered for `app_type`, if any; otherwise
    /// publishes the envelope locally under `group:<gid>:*` (spec.md §4.6's
    /// documented fallback).
    fn dispatch_or_publish(&self, app_type: &str, env: GroupEnvelope) {
        let handler = self.handlers.read().get(app_type).cloned();
        run_dispatch(&handler, &self.mq, env);
    }
}

fn run_dispatch(handler: &Option<GroupEventHandler>, mq: &crate::mq::MqManager, env: GroupEnvelope) {
    match handler {
        Some(h) => h(env),
        None => {
            let topic = format!("group:{}:*", env.group);
            let from = env.from.clone();
            let payload = serde_json::to_value(&env).unwrap_or_default();
            mq.publish_local(&topic, &from, payload);
        }
    }
}

async fn write_envelope<W: AsyncWriteExt + Unpin>(w: &mut W, env: &GroupEnvelope) -> GoopResult<()> {
    let mut bytes = serde_json::to_vec(env).map_err(|e| GoopError::ProtocolError(e.to_string()))?;
    bytes.push(b'\n');
    w.write_all(&bytes).await?;
    Ok(())
}

async fn read_envelope<R: AsyncBufReadExt + Unpin>(r: &mut R) -> GoopResult<GroupEnvelope> {
    let mut line = Vec::new();
    let n = r.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(GoopError::ChannelClosed);
    }
    serde_json::from_slice(&line).map_err(|e| GoopError::ProtocolError(e.to_string()))
}

