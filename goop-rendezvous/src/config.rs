//! Rendezvous-side configuration (spec.md §6), clap-derived like the
//! teacher's peer-side config.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "goop-rendezvous", about = "Goop squared rendezvous and relay service")]
pub struct RendezvousConfig {
    /// Address the HTTP rendezvous surface binds to.
    #[arg(long, env = "GOOP_RENDEZVOUS_BIND", default_value = "0.0.0.0:8787")]
    pub bind: SocketAddr,

    /// SQLite file backing peer persistence. Omit for an in-memory store
    /// (single replica only).
    #[arg(long, env = "GOOP_RENDEZVOUS_DB")]
    pub db_path: Option<PathBuf>,

    /// Basic-auth password guarding the admin endpoints. The username is
    /// always `admin`.
    #[arg(long, env = "GOOP_RENDEZVOUS_ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    /// This replica's externally reachable URL, used to synthesise the
    /// relay's first advertised address.
    #[arg(long, env = "GOOP_RENDEZVOUS_EXTERNAL_URL")]
    pub external_url: Option<String>,

    /// Enables the circuit-relay host (spec.md §4.4).
    #[arg(long, env = "GOOP_RENDEZVOUS_RELAY", default_value_t = false)]
    pub relay_enabled: bool,

    /// Port the relay identity listens on.
    #[arg(long, env = "GOOP_RENDEZVOUS_RELAY_PORT", default_value_t = 4433)]
    pub relay_port: u16,

    /// Directory holding `relay.key` and any other rendezvous-local state.
    #[arg(long, env = "GOOP_RENDEZVOUS_STATE_DIR", default_value = "./rendezvous-state")]
    pub state_dir: PathBuf,

    /// Directory of site templates served by the template store.
    #[arg(long, env = "GOOP_RENDEZVOUS_TEMPLATES_DIR")]
    pub templates_dir: Option<PathBuf>,

    #[arg(long, env = "GOOP_RENDEZVOUS_RELAY_CLEANUP_SEC", default_value_t = 300)]
    pub relay_cleanup_sec: u64,
    #[arg(long, env = "GOOP_RENDEZVOUS_RELAY_POLL_SEC", default_value_t = 15)]
    pub relay_poll_sec: u64,
    #[arg(long, env = "GOOP_RENDEZVOUS_RELAY_CONNECT_SEC", default_value_t = 10)]
    pub relay_connect_sec: u64,
    #[arg(long, env = "GOOP_RENDEZVOUS_RELAY_REFRESH_SEC", default_value_t = 300)]
    pub relay_refresh_sec: u64,
    #[arg(long, env = "GOOP_RENDEZVOUS_RELAY_RECOVERY_SEC", default_value_t = 60)]
    pub relay_recovery_sec: u64,
}

impl RendezvousConfig {
    pub fn relay_key_path(&self) -> PathBuf {
        self.state_dir.join("relay.key")
    }
}
