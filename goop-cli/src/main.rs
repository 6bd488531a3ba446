//! Process entrypoint: loads `PeerConfig`, optionally embeds the
//! rendezvous/relay service in this same process (spec.md §2 "the
//! rendezvous server is an independent embedded HTTP service that may run
//! in the same process or alone"), bootstraps the peer runtime, and blocks
//! until shutdown.

use std::net::SocketAddr;

use goop_peer::runtime::Runtime;
use goop_rendezvous::config::RendezvousConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("goop=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = goop_peer::config::PeerConfig::load()?;

    // `presence.rendezvous_only` means this peer never embeds a
    // relay/rendezvous and only speaks to a remote one (spec.md §6).
    if config.presence_rendezvous_host && !config.presence_rendezvous_only {
        let rendezvous_config = embedded_rendezvous_config(&config);
        let server = goop_rendezvous::server::Server::bootstrap(rendezvous_config).await?;
        server.run().await?;
    }

    let runtime = Runtime::bootstrap(config).await?;
    runtime.run().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down goop peer");
    runtime.shutdown().await;
    Ok(())
}

/// Derives the embedded rendezvous's config from the peer config's
/// `presence.*` fields (spec.md §6).
fn embedded_rendezvous_config(config: &goop_peer::config::PeerConfig) -> RendezvousConfig {
    let bind: SocketAddr = format!("{}:{}", config.presence_rendezvous_bind, config.presence_rendezvous_port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], config.presence_rendezvous_port)));

    RendezvousConfig {
        bind,
        db_path: Some(config.peer_dir.join("rendezvous.db")),
        admin_password: config.presence_admin_password.clone(),
        external_url: config.presence_external_url.clone(),
        relay_enabled: true,
        relay_port: config.presence_relay_port,
        state_dir: config.peer_dir.join("rendezvous-state"),
        templates_dir: config.paths_templates_dir.clone(),
        relay_cleanup_sec: config.presence_relay_cleanup_sec,
        relay_poll_sec: config.presence_relay_poll_sec,
        relay_connect_sec: config.presence_relay_connect_sec,
        relay_refresh_sec: config.presence_relay_refresh_sec,
        relay_recovery_sec: config.presence_relay_recovery_sec,
    }
}
