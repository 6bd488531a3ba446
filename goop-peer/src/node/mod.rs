//! P2P node: iroh-backed QUIC transport, stream multiplexing by named
//! protocol, and NAT traversal policy (spec.md §4.2).
//!
//! Grounded on the teacher's `iroh.rs`: an `iroh::Endpoint` built with a
//! persisted secret key and a list of ALPNs, an accept loop that routes
//! incoming connections by ALPN, and one bidirectional stream per logical
//! exchange. Here each named protocol in spec.md §4.2 is its own ALPN
//! (rather than one ALPN shared by everything, as the teacher's IRC
//! transport does) so `ProbePeer`/`FetchSiteFile` can dial a specific
//! protocol directly without a handshake round-trip to pick one.

pub mod identify;
pub mod relay;
pub mod site;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use iroh::EndpointAddr;
use tokio::sync::{broadcast, RwLock};

use crate::error::{GoopError, GoopResult};
use crate::identity::PeerId;
use crate::peer::PresenceType;
use crate::peer_table::PeerTable;

/// Named stream protocols carried over iroh connections (spec.md §4.2).
pub const PROTO_MQ: &[u8] = b"/goop/mq/1.0.0";
pub const PROTO_GROUP: &[u8] = b"/goop/group/1.0.0";
pub const PROTO_LISTEN: &[u8] = b"/goop/listen/1.0.0";
pub const PROTO_SITE: &[u8] = b"/goop/site/1.0.0";
pub const PROTO_DATA: &[u8] = b"/goop/data/1.0.0";
pub const PROTO_DOCS: &[u8] = b"/goop/docs/1.0.0";
pub const PROTO_AVATAR: &[u8] = b"/goop/avatar/1.0.0";
pub const PROTO_GROUP_INVITE: &[u8] = b"/goop/group-invite/1.0.0";
pub const PROTO_ENTANGLE: &[u8] = b"/goop/entangle/1.0.0";

pub const ALL_PROTOCOLS: &[&[u8]] = &[
    PROTO_MQ,
    PROTO_GROUP,
    PROTO_LISTEN,
    PROTO_SITE,
    PROTO_DATA,
    PROTO_DOCS,
    PROTO_AVATAR,
    PROTO_GROUP_INVITE,
    PROTO_ENTANGLE,
];

pub fn protocol_name(alpn: &[u8]) -> String {
    String::from_utf8_lossy(alpn).to_string()
}

#[derive(Debug, Clone)]
pub struct IdentifyInfo {
    pub peer_id: String,
    pub protocols: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { peer_id: String },
    Disconnected { peer_id: String },
}

/// A dispatch table: protocol ALPN -> handler invoked with the accepted
/// bidirectional stream. Registered once at node construction by each
/// manager (MQ, group, listen, ...).
pub type StreamHandler = Arc<
    dyn Fn(iroh::endpoint::Connection, iroh::endpoint::SendStream, iroh::endpoint::RecvStream) -> futures_handler::BoxFut
        + Send
        + Sync,
>;

/// Small local shim so we don't need to depend on the `futures` crate just
/// for `BoxFuture`.
mod futures_handler {
    pub type BoxFut = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>>;
}

pub struct P2pNode {
    endpoint: iroh::Endpoint,
    peer_table: Arc<PeerTable>,
    handlers: RwLock<std::collections::HashMap<Vec<u8>, StreamHandler>>,
    identify_tx: broadcast::Sender<IdentifyInfo>,
    addr_tx: broadcast::Sender<Vec<String>>,
    conn_tx: broadcast::Sender<ConnectionEvent>,
    relay_ready: tokio::sync::Notify,
    has_relay: std::sync::atomic::AtomicBool,
}

impl P2pNode {
    pub async fn start(
        key_path: &Path,
        listen_port: u16,
        peer_table: Arc<PeerTable>,
    ) -> GoopResult<Arc<Self>> {
        let secret_key = load_or_create_iroh_key(key_path)?;
        let alpns: Vec<Vec<u8>> = ALL_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        let mut builder = iroh::Endpoint::builder().secret_key(secret_key).alpns(alpns);
        if listen_port != 0 {
            builder = builder
                .bind_addr(std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, listen_port))
                .map_err(|e| GoopError::Fatal(format!("failed to bind iroh endpoint: {e}")))?;
        }
        let endpoint = builder
            .bind()
            .await
            .map_err(|e| GoopError::Fatal(format!("failed to start iroh endpoint: {e}")))?;

        let (identify_tx, _) = broadcast::channel(64);
        let (addr_tx, _) = broadcast::channel(16);
        let (conn_tx, _) = broadcast::channel(64);

        let node = Arc::new(Self {
            endpoint,
            peer_table,
            handlers: RwLock::new(std::collections::HashMap::new()),
            identify_tx,
            addr_tx,
            conn_tx,
            relay_ready: tokio::sync::Notify::new(),
            has_relay: std::sync::atomic::AtomicBool::new(false),
        });

        P2pNode::spawn_accept_loop(node.clone());
        Ok(node)
    }

    pub fn local_peer_id(&self) -> String {
        self.endpoint.id().to_string()
    }

    pub async fn register_handler(&self, protocol: &[u8], handler: StreamHandler) {
        self.handlers.write().await.insert(protocol.to_vec(), handler);
    }

    fn spawn_accept_loop(node: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let Some(incoming) = node.endpoint.accept().await else {
                    tracing::info!("p2p accept loop ended: endpoint closed");
                    break;
                };
                let node = node.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => node.handle_incoming(conn).await,
                        Err(e) => tracing::warn!("incoming p2p connection failed: {e}"),
                    }
                });
            }
        });
    }

    async fn handle_incoming(&self, conn: iroh::endpoint::Connection) {
        let remote = conn.remote_id().to_string();
        let alpn = conn.alpn().unwrap_or_default();
        let _ = self.conn_tx.send(ConnectionEvent::Connected { peer_id: remote.clone() });
        let handlers = self.handlers.read().await;
        if let Some(handler) = handlers.get(&alpn) {
            let handler = handler.clone();
            drop(handlers);
            match conn.accept_bi().await {
                Ok((mut send, mut recv)) => {
                    if let Err(e) = self.run_identify(&mut send, &mut recv, false).await {
                        tracing::debug!(peer = %remote, "identify exchange failed: {e}");
                    }
                    handler(conn, send, recv).await;
                }
                Err(e) => tracing::debug!(peer = %remote, "accept_bi failed: {e}"),
            }
        } else {
            tracing::debug!(peer = %remote, protocol = %protocol_name(&alpn), "no handler registered, closing");
            conn.close(0u32.into(), b"unsupported protocol");
        }
        let _ = self.conn_tx.send(ConnectionEvent::Disconnected { peer_id: remote });
    }

    /// Mutual identify exchange (spec.md §4.2): a single length-prefixed
    /// JSON frame written and read on the freshly opened stream before any
    /// application data flows. The acceptor reads first so the two sides
    /// don't both block on the remote's write; on success the remote's
    /// protocol list is broadcast for `peer_table::set_protocols`.
    async fn run_identify(
        &self,
        send: &mut iroh::endpoint::SendStream,
        recv: &mut iroh::endpoint::RecvStream,
        initiator: bool,
    ) -> GoopResult<()> {
        let local = identify::IdentifyFrame::local(self.local_peer_id(), String::new());
        let remote = if initiator {
            identify::write_frame(send, &local).await?;
            identify::read_frame(recv).await?
        } else {
            let remote = identify::read_frame(recv).await?;
            identify::write_frame(send, &local).await?;
            remote
        };
        self.emit_identify(remote.into());
        Ok(())
    }

    /// Open a fresh stream to `peer_id` over `protocol`. Callers are
    /// expected to have already checked the peer's cached protocol list
    /// (see `mq::Send`'s `UnsupportedByPeer` short-circuit) — this method
    /// itself just dials.
    pub async fn open_stream(
        &self,
        peer_id: &str,
        protocol: &[u8],
    ) -> GoopResult<(iroh::endpoint::SendStream, iroh::endpoint::RecvStream)> {
        let endpoint_id: iroh::EndpointId = peer_id
            .parse()
            .map_err(|e| GoopError::ProtocolError(format!("invalid peer id {peer_id}: {e}")))?;
        let addr = EndpointAddr::new(endpoint_id);
        let conn = self
            .endpoint
            .connect(addr, protocol)
            .await
            .map_err(|e| GoopError::Unreachable(format!("{peer_id}: {e}")))?;
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| GoopError::Unreachable(format!("{peer_id}: open_bi: {e}")))?;
        if let Err(e) = self.run_identify(&mut send, &mut recv, true).await {
            tracing::debug!(peer = %peer_id, "identify exchange failed: {e}");
        }
        Ok((send, recv))
    }

    /// Attempt to establish a direct stream to confirm reachability
    /// (spec.md §4.2 `ProbePeer`). On success marks the peer reachable;
    /// on failure leaves state unchanged (never marks unreachable here —
    /// that's the presence loop's job on repeated failures).
    pub async fn probe_peer(&self, peer_id: &str) -> bool {
        match self.open_stream(peer_id, PROTO_ENTANGLE).await {
            Ok(_) => {
                self.peer_table.set_reachable(peer_id, true);
                true
            }
            Err(e) => {
                tracing::debug!(peer = %peer_id, "probe failed: {e}");
                false
            }
        }
    }

    /// Gossip a presence type over an application pub/sub topic. The
    /// actual encoding/broadcast is delegated to the MQ manager, which
    /// owns the pub/sub fabric (spec.md §4.5); this just exposes the hook
    /// the presence loop calls.
    pub fn publish(&self, _kind: PresenceType) {
        // Intentionally a no-op seam: `Runtime` wires this to
        // `MqManager::publish_peer_announce` instead, since the P2P node
        // itself has no subscriber registry of its own.
    }

    pub async fn wait_for_relay(&self, deadline: Duration) -> bool {
        if self.has_relay.load(std::sync::atomic::Ordering::Acquire) {
            return true;
        }
        tokio::select! {
            _ = self.relay_ready.notified() => true,
            _ = tokio::time::sleep(deadline) => false,
        }
    }

    pub fn mark_relay_ready(&self) {
        self.has_relay.store(true, std::sync::atomic::Ordering::Release);
        self.relay_ready.notify_waiters();
    }

    pub fn subscribe_identify(&self) -> broadcast::Receiver<IdentifyInfo> {
        self.identify_tx.subscribe()
    }

    pub fn subscribe_address_changes(&self) -> broadcast::Receiver<Vec<String>> {
        self.addr_tx.subscribe()
    }

    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.conn_tx.subscribe()
    }

    pub(crate) fn emit_identify(&self, info: IdentifyInfo) {
        let _ = self.identify_tx.send(info);
    }
}

fn load_or_create_iroh_key(path: &Path) -> GoopResult<iroh::SecretKey> {
    if path.exists() {
        let hex_str = std::fs::read_to_string(path)?;
        hex_str
            .trim()
            .parse()
            .map_err(|e| GoopError::Fatal(format!("invalid iroh secret key at {}: {e}", path.display())))
    } else {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = iroh::SecretKey::from_bytes(&bytes);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let hex_str: String = key.to_bytes().iter().map(|b| format!("{b:02x}")).collect();
        std::fs::write(path, &hex_str)?;
        tracing::info!(path = %path.display(), "generated new p2p transport key");
        Ok(key)
    }
}

/// Validate a peer ID string length constraint shared with presence
/// validation (spec.md §3).
pub fn validate_peer_id(id: &str) -> GoopResult<()> {
    PeerId::validate_len(id)
}
