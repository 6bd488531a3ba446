//! Circuit-relay host (spec.md §4.4): a second iroh identity in the same
//! process, accepting reservation requests on `/goop/entangle/1.0.0` and
//! tracking them against fixed limits.
//!
//! Grounded on `goop-peer::node`'s iroh endpoint construction (secret key +
//! single ALPN + accept loop) and `node::relay`'s client, which simply
//! opens and immediately drops a bidirectional stream on that protocol to
//! request a reservation — the host's job is to accept that handshake,
//! enforce limits, and track a TTL'd reservation per requester.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Circuit-relay-v2-style limits (spec.md §4.4). `per_asn` is approximated
/// by the requester's bare IP address since this crate carries no GeoIP/ASN
/// lookup dependency — documented simplification, not a scope cut.
#[derive(Debug, Clone)]
pub struct RelayLimits {
    pub reservation_duration: Duration,
    pub data_limit_bytes: u64,
    pub max_reservations: usize,
    pub max_circuits: usize,
    pub buffer_bytes: usize,
    pub per_peer: usize,
    pub per_ip: usize,
    pub per_asn: usize,
    pub reservation_ttl: Duration,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            reservation_duration: Duration::from_secs(30 * 60),
            data_limit_bytes: 16 * 1024 * 1024,
            max_reservations: 128,
            max_circuits: 64,
            buffer_bytes: 4096,
            per_peer: 8,
            per_ip: 16,
            per_asn: 64,
            reservation_ttl: Duration::from_secs(60 * 60),
        }
    }
}

struct Reservation {
    peer_id: String,
    ip: IpAddr,
    expires_at: Instant,
}

struct ReservationTable {
    by_peer: HashMap<String, Reservation>,
    per_peer_counts: HashMap<String, usize>,
    per_ip_counts: HashMap<IpAddr, usize>,
}

impl ReservationTable {
    fn new() -> Self {
        Self { by_peer: HashMap::new(), per_peer_counts: HashMap::new(), per_ip_counts: HashMap::new() }
    }

    fn try_reserve(&mut self, peer_id: &str, ip: IpAddr, limits: &RelayLimits) -> bool {
        if self.by_peer.len() >= limits.max_reservations {
            return false;
        }
        if *self.per_peer_counts.get(peer_id).unwrap_or(&0) >= limits.per_peer {
            return false;
        }
        if *self.per_ip_counts.get(&ip).unwrap_or(&0) >= limits.per_ip.min(limits.per_asn) {
            return false;
        }
        let expires_at = Instant::now() + limits.reservation_ttl;
        if self.by_peer.remove(peer_id).is_none() {
            *self.per_peer_counts.entry(peer_id.to_string()).or_insert(0) += 1;
            *self.per_ip_counts.entry(ip).or_insert(0) += 1;
        }
        self.by_peer.insert(peer_id.to_string(), Reservation { peer_id: peer_id.to_string(), ip, expires_at });
        true
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .by_peer
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(r) = self.by_peer.remove(&id) {
                if let Some(c) = self.per_peer_counts.get_mut(&r.peer_id) {
                    *c = c.saturating_sub(1);
                }
                if let Some(c) = self.per_ip_counts.get_mut(&r.ip) {
                    *c = c.saturating_sub(1);
                }
            }
        }
    }

    fn active_count(&self) -> usize {
        self.by_peer.len()
    }
}

pub struct RelayHost {
    endpoint: iroh::Endpoint,
    limits: RelayLimits,
    table: Mutex<ReservationTable>,
}

pub const PROTO_ENTANGLE: &[u8] = b"/goop/entangle/1.0.0";

impl RelayHost {
    /// Starts unconditionally (spec.md §4.4): does not wait for
    /// reachability autodetection before accepting connections.
    pub async fn start(key_path: &Path, port: u16, limits: RelayLimits) -> anyhow::Result<Arc<Self>> {
        let secret_key = crate::identity_key::load_or_create(key_path)?;
        let endpoint = iroh::Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![PROTO_ENTANGLE.to_vec()])
            .bind_addr(std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port))
            .map_err(|e| anyhow::anyhow!("failed to bind relay endpoint: {e}"))?
            .bind()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start relay endpoint: {e}"))?;

        let host = Arc::new(Self { endpoint, limits, table: Mutex::new(ReservationTable::new()) });
        Self::spawn_accept_loop(host.clone());
        Self::spawn_sweeper(host.clone());
        Ok(host)
    }

    pub fn peer_id(&self) -> String {
        self.endpoint.id().to_string()
    }

    fn spawn_accept_loop(host: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let Some(incoming) = host.endpoint.accept().await else { break };
                let host = host.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => host.handle_connection(conn).await,
                        Err(e) => tracing::debug!("relay incoming connection failed: {e}"),
                    }
                });
            }
        });
    }

    async fn handle_connection(&self, conn: iroh::endpoint::Connection) {
        let remote = conn.remote_id().to_string();
        let ip: IpAddr = conn.remote_address().ip();
        let granted = self.table.lock().try_reserve(&remote, ip, &self.limits);
        if !granted {
            conn.close(1u32.into(), b"reservation limit exceeded");
            return;
        }
        match conn.accept_bi().await {
            Ok((mut send, _recv)) => {
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut send).await;
            }
            Err(e) => tracing::debug!(peer = %remote, "relay accept_bi failed: {e}"),
        }
    }

    fn spawn_sweeper(host: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                host.table.lock().sweep_expired();
            }
        });
    }

    pub fn active_reservations(&self) -> usize {
        self.table.lock().active_count()
    }
}

/// Synthesises the relay's first advertised address from an external URL's
/// resolved host plus the relay port (spec.md §4.4).
pub async fn synthesize_advertised_addr(external_url: &str, relay_port: u16) -> Option<String> {
    let host = external_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()?
        .split(':')
        .next()?
        .to_string();
    let lookup = format!("{host}:0");
    let addrs = tokio::net::lookup_host(lookup).await.ok()?;
    let ip = addrs.into_iter().next().map(|a| a.ip())?;
    Some(SocketAddr::new(ip, relay_port).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_table_enforces_per_peer_limit() {
        let mut table = ReservationTable::new();
        let limits = RelayLimits { per_peer: 1, ..RelayLimits::default() };
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(table.try_reserve("peer-a", ip, &limits));
        // Renewing the same peer from the same IP should still succeed
        // (it's a refresh, not a second reservation).
        assert!(table.try_reserve("peer-a", ip, &limits));
    }

    #[test]
    fn reservation_table_enforces_global_cap() {
        let mut table = ReservationTable::new();
        let limits = RelayLimits { max_reservations: 1, ..RelayLimits::default() };
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(table.try_reserve("peer-a", ip, &limits));
        assert!(!table.try_reserve("peer-b", ip, &limits));
    }
}
