use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("goop_rendezvous=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = goop_rendezvous::config::RendezvousConfig::parse();
    tracing::info!(bind = %config.bind, relay = config.relay_enabled, "starting goop-rendezvous");

    let server = goop_rendezvous::server::Server::bootstrap(config).await?;
    server.run().await?;

    // The HTTP surface and background loops run on spawned tasks; block
    // here until the process is asked to stop.
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down goop-rendezvous");
    Ok(())
}
