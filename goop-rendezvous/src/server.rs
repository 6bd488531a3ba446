//! Bootstraps the rendezvous service: opens the peer DB, builds shared
//! state, optionally starts the relay host, then serves HTTP.
//!
//! Grounded on `goop-peer::runtime::Runtime`'s construction order (config
//! → storage → background loops → serve), itself grounded on the teacher's
//! `main.rs`/`server.rs` bootstrap sequence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RendezvousConfig;
use crate::db::Db;
use crate::relay_host::{synthesize_advertised_addr, RelayHost, RelayLimits};
use crate::state::SharedState;
use crate::templates::TemplateStore;
use crate::web::AppState;

/// Multi-replica sync cadence (spec.md §4.3): check the DB fingerprint
/// every 3 s.
const SYNC_INTERVAL: Duration = Duration::from_secs(3);
/// Stale-peer purge cadence and cutoff (spec.md §4.3).
const PURGE_INTERVAL: Duration = Duration::from_secs(5);
const STALE_CUTOFF_MS: u64 = 30_000;

pub struct Server {
    pub state: Arc<AppState>,
    pub relay: Option<Arc<RelayHost>>,
    config: RendezvousConfig,
}

impl Server {
    pub async fn bootstrap(config: RendezvousConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;

        let db = match &config.db_path {
            Some(path) => Some(Db::open(path)?),
            None => None,
        };
        let shared = Arc::new(SharedState::new(db, config.admin_password.clone()));

        let relay = if config.relay_enabled {
            let limits = RelayLimits {
                reservation_ttl: Duration::from_secs(config.relay_cleanup_sec.max(1) * 120),
                ..RelayLimits::default()
            };
            let host = RelayHost::start(&config.relay_key_path(), config.relay_port, limits).await?;
            let addrs = match &config.external_url {
                Some(url) => synthesize_advertised_addr(url, config.relay_port).await.into_iter().collect(),
                None => Vec::new(),
            };
            *shared.relay_info.lock() = Some(crate::model::RelayInfo {
                peer_id: host.peer_id(),
                addrs,
                cleanup_delay_s: config.relay_cleanup_sec,
                poll_deadline_s: config.relay_poll_sec,
                connect_timeout_s: config.relay_connect_sec,
                refresh_interval_s: config.relay_refresh_sec,
                recovery_grace_s: config.relay_recovery_sec,
            });
            Some(host)
        } else {
            None
        };

        let templates = config.templates_dir.clone().map(TemplateStore::new);
        let state = Arc::new(AppState { shared, templates });

        Ok(Self { state, relay, config })
    }

    fn spawn_sync_loops(&self) {
        let shared = self.state.shared.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNC_INTERVAL);
            loop {
                ticker.tick().await;
                shared.sync_from_db_if_changed();
            }
        });

        let shared = self.state.shared.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            loop {
                ticker.tick().await;
                shared.purge_stale(STALE_CUTOFF_MS);
            }
        });
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.spawn_sync_loops();
        let addr: SocketAddr = self.config.bind;
        crate::web::serve(addr, self.state.clone()).await?;
        if let Some(relay) = &self.relay {
            tracing::info!(peer_id = %relay.peer_id(), port = self.config.relay_port, "relay host running");
        }
        Ok(())
    }
}
