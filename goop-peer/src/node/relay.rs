//! Relay reservation client (spec.md §4.2, §4.4): periodically asks a
//! rendezvous-hosted relay for a reservation so peers behind symmetric NATs
//! stay reachable, and drives `P2pNode::wait_for_relay`/`mark_relay_ready`.
//!
//! Grounded on the teacher's `s2s.rs` reconnect-with-backoff loop: fixed
//! poll interval, exponential backoff on failure capped at a ceiling, and a
//! recovery path that resumes the normal poll cadence once a reservation
//! succeeds again.

use std::sync::Arc;
use std::time::Duration;

use crate::node::P2pNode;

pub struct RelayClientConfig {
    pub relay_peer_id: String,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub refresh_interval: Duration,
    pub recovery_interval: Duration,
}

/// Runs until the process shuts down. Intended to be spawned once by
/// `Runtime` when `presence.rendezvous_only` names a relay peer to use.
pub async fn run_relay_client(node: Arc<P2pNode>, cfg: RelayClientConfig) {
    let mut backoff = cfg.poll_interval;
    loop {
        match request_reservation(&node, &cfg).await {
            Ok(()) => {
                node.mark_relay_ready();
                backoff = cfg.poll_interval;
                tokio::time::sleep(cfg.refresh_interval).await;
            }
            Err(e) => {
                tracing::warn!(relay = %cfg.relay_peer_id, "relay reservation failed: {e}");
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, cfg.recovery_interval);
            }
        }
    }
}

async fn request_reservation(node: &P2pNode, cfg: &RelayClientConfig) -> crate::error::GoopResult<()> {
    let fut = node.open_stream(&cfg.relay_peer_id, crate::node::PROTO_ENTANGLE);
    let (send, recv) = tokio::time::timeout(cfg.connect_timeout, fut)
        .await
        .map_err(|_| crate::error::GoopError::Timeout(cfg.connect_timeout))??;
    drop(send);
    drop(recv);
    Ok(())
}
