//! Bootstraps and wires every manager together (spec.md §2 "Control flow",
//! §5): opens the peer DB, creates the P2P node, wires MQ/group/listen/call
//! as subscribers of the signalling bus, publishes an `online` presence,
//! then sits in a reactive loop driven by timers and inbound streams.
//!
//! Grounded on the teacher's `main.rs`/`server.rs` construction order
//! (config → identity/db → transport → protocol managers → background
//! tasks → serve), with graceful shutdown modeled on `iroh.rs`'s pattern of
//! aborting background bridge tasks before closing the transport.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::cached_store::CachedPeerStore;
use crate::call::{mq_signaler, CallManager};
use crate::config::PeerConfig;
use crate::content_store::ContentStore;
use crate::error::{GoopResult, LogLevel};
use crate::group::{EnvelopeKind, GroupManager, MembersPayload};
use crate::identity::Identity;
use crate::listen::ListenManager;
use crate::mq::MqManager;
use crate::node::{P2pNode, PROTO_GROUP, PROTO_LISTEN, PROTO_MQ, PROTO_SITE};
use crate::peer_table::PeerTable;
use crate::presence::{PresenceLoop, ProfileInfo};

/// Mirrors the rendezvous `/relay` response shape (spec.md §3 RelayInfo),
/// duplicated here rather than imported since `goop-peer` has no
/// dependency on `goop-rendezvous`.
#[derive(Debug, Deserialize)]
struct RelayInfo {
    peer_id: String,
    #[allow(dead_code)]
    #[serde(default)]
    addrs: Vec<String>,
    #[serde(default)]
    connect_timeout_s: Option<u64>,
    #[serde(default)]
    poll_deadline_s: Option<u64>,
    #[serde(default)]
    refresh_interval_s: Option<u64>,
    #[serde(default)]
    recovery_grace_s: Option<u64>,
}

pub struct Runtime {
    pub identity: Identity,
    pub peer_table: Arc<PeerTable>,
    pub cached_store: Arc<Mutex<CachedPeerStore>>,
    pub node: Arc<P2pNode>,
    pub mq: Arc<MqManager>,
    pub groups: Arc<GroupManager>,
    pub listen: Arc<ListenManager>,
    pub calls: Arc<CallManager>,
    pub content: Arc<ContentStore>,
    pub presence: Arc<PresenceLoop>,
    pub config: PeerConfig,
}

impl Runtime {
    /// Assembles every manager and registers protocol handlers, but does
    /// not yet publish presence or start background loops — call
    /// `Runtime::run` for that.
    pub async fn bootstrap(config: PeerConfig) -> GoopResult<Arc<Self>> {
        std::fs::create_dir_all(&config.peer_dir)?;

        let identity = Identity::load_or_create(&config.identity_key_path())?;
        let local_peer_id = identity.peer_id().to_string();

        let cached_store = Arc::new(Mutex::new(CachedPeerStore::open(config.db_path())?));
        let peer_table = Arc::new(PeerTable::new());
        let content = Arc::new(ContentStore::open(config.site_root())?);

        let node = P2pNode::start(&config.peer_dir.join("transport.key"), config.p2p_listen_port, peer_table.clone()).await?;

        let mq = MqManager::new(node.clone(), peer_table.clone(), local_peer_id.clone());
        let groups = GroupManager::new(node.clone(), local_peer_id.clone(), mq.clone());
        let listen = ListenManager::new(node.clone(), groups.clone(), config.listen_queue_path(), local_peer_id.clone());
        // Wires the listen manager into the group protocol's app_type
        // dispatch (spec.md §4.6/§4.7): a `Members` event for a group of
        // app_type "listen" feeds late-joiner catch-up re-sync.
        let listen_for_members = listen.clone();
        groups.register_handler(
            "listen",
            Arc::new(move |env| {
                if env.kind == EnvelopeKind::Members {
                    if let Ok(payload) = serde_json::from_value::<MembersPayload>(env.payload) {
                        listen_for_members.note_members(payload.members);
                    }
                }
            }),
        );
        let signaler = mq_signaler(mq.clone());
        let calls = CallManager::new(signaler, local_peer_id.clone());

        let profile = ProfileInfo {
            content: config.profile_label.clone(),
            email: config.profile_email.clone(),
            avatar_hash: None,
            video_disabled: false,
            active_template: None,
        };
        let presence = PresenceLoop::new(
            node.clone(),
            peer_table.clone(),
            mq.clone(),
            cached_store.clone(),
            local_peer_id.clone(),
            profile,
            config.presence_rendezvous_wan.clone(),
            std::time::Duration::from_secs(config.presence_ttl_sec),
            config.offline_grace(),
            std::time::Duration::from_secs(config.presence_heartbeat_sec),
        );

        let runtime = Arc::new(Self {
            identity,
            peer_table,
            cached_store,
            node,
            mq,
            groups,
            listen,
            calls,
            content,
            presence,
            config,
        });
        runtime.register_protocol_handlers();
        Ok(runtime)
    }

    fn register_protocol_handlers(self: &Arc<Self>) {
        let mq = self.mq.clone();
        let mq_handler: crate::node::StreamHandler = Arc::new(move |_conn, _send, recv| {
            let mq = mq.clone();
            Box::pin(async move { mq.handle_inbound_stream(recv).await })
        });

        let groups = self.groups.clone();
        let group_handler: crate::node::StreamHandler = Arc::new(move |_conn, send, recv| {
            let groups = groups.clone();
            Box::pin(async move {
                if let Err(e) = groups.handle_inbound_stream(send, recv).await {
                    tracing::warn!("group inbound stream failed: {e}");
                }
            })
        });

        let listen = self.listen.clone();
        let listen_handler: crate::node::StreamHandler = Arc::new(move |_conn, send, recv| {
            let listen = listen.clone();
            Box::pin(async move {
                if let Err(e) = listen.serve_audio_request(send, recv).await {
                    tracing::warn!("listen audio stream failed: {e}");
                }
            })
        });

        let content = self.content.clone();
        let site_handler: crate::node::StreamHandler = Arc::new(move |_conn, send, recv| {
            let content = content.clone();
            Box::pin(async move {
                let resolve = move |path: &str| content.read_for_site_fetch(path);
                if let Err(e) = crate::node::site::serve_site_request(send, recv, resolve).await {
                    tracing::warn!("site fetch failed: {e}");
                }
            })
        });

        let node = self.node.clone();
        tokio::spawn(async move {
            node.register_handler(PROTO_MQ, mq_handler).await;
            node.register_handler(PROTO_GROUP, group_handler).await;
            node.register_handler(PROTO_LISTEN, listen_handler).await;
            node.register_handler(PROTO_SITE, site_handler).await;
        });
    }

    /// Looks up relay info from the configured rendezvous and, if present,
    /// spawns the relay reservation client (spec.md §4.2, §4.4).
    async fn spawn_relay_client_if_configured(self: &Arc<Self>) {
        let Some(base) = self.config.presence_rendezvous_wan.clone() else { return };
        let url = format!("{}/relay", base.trim_end_matches('/'));
        let client = reqwest::Client::new();
        let relay_info: Option<RelayInfo> = match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => None,
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "unexpected /relay response");
                None
            }
            Err(e) => {
                tracing::warn!("failed to fetch relay info: {e}");
                None
            }
        };
        let Some(relay_info) = relay_info else { return };
        let cfg = crate::node::relay::RelayClientConfig {
            relay_peer_id: relay_info.peer_id,
            poll_interval: std::time::Duration::from_secs(relay_info.poll_deadline_s.unwrap_or(15)),
            connect_timeout: std::time::Duration::from_secs(relay_info.connect_timeout_s.unwrap_or(10)),
            refresh_interval: std::time::Duration::from_secs(relay_info.refresh_interval_s.unwrap_or(300)),
            recovery_interval: std::time::Duration::from_secs(relay_info.recovery_grace_s.unwrap_or(60)),
        };
        let node = self.node.clone();
        tokio::spawn(crate::node::relay::run_relay_client(node, cfg));
    }

    /// Starts background loops and publishes an initial `online` presence.
    /// Returns once everything is running; the process should then block
    /// on a shutdown signal and call `Runtime::shutdown`.
    pub async fn run(self: &Arc<Self>) -> GoopResult<()> {
        self.presence.restore_cached_peers()?;
        self.listen.restore_from_disk().await.ok();
        self.presence.spawn();
        self.listen.clone().spawn_ticker();
        self.spawn_relay_client_if_configured().await;

        if self.config.viewer_http_addr.port() != 0 {
            crate::viewer::serve(self.config.viewer_http_addr, self.calls.clone()).await?;
        }

        self.mq.publish_log("runtime", LogLevel::Info, "peer runtime started");
        tracing::info!(peer_id = %self.identity.peer_id(), "goop peer runtime running");
        Ok(())
    }

    /// Broadcasts a final `offline` presence with a fresh context (spec.md
    /// §7) and closes outstanding call sessions. Background tasks spawned
    /// with `tokio::spawn` are left to end naturally as the process exits;
    /// there is no partial-shutdown state to corrupt.
    pub async fn shutdown(self: &Arc<Self>) {
        self.calls.close().await;
        self.presence.announce_offline().await;
    }
}

/// Reads one line from stdin as a crude interactive REPL seam for the CLI
/// binary (e.g. typing `quit` to trigger shutdown). Kept here rather than
/// in `goop-cli` since it has no other dependencies worth a crate split.
pub async fn read_stdin_line() -> GoopResult<String> {
    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    reader.read_line(&mut line).await?;
    Ok(line.trim().to_string())
}
