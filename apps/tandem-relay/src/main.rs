use anyhow::Context;
use clap::Parser;
use tracing::info;

use tandem_relay::config::Config;
use tandem_relay::router;
use tandem_relay::websocket::RelayState;

#[derive(Parser, Debug)]
#[command(name = "tandem-relay", about = "Signaling relay for two-party calls")]
struct Cli {
    /// Listen port (overrides TANDEM_RELAY_PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!(
        port = config.port,
        ice_servers = config.ice_servers.len(),
        heartbeat_timeout = ?config.heartbeat_timeout,
        "starting tandem relay"
    );

    let state = RelayState::new(config.clone());
    let _monitor = state.spawn_stale_monitor();
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("tandem relay listening on {}", addr);

    axum::serve(listener, app).await.context("relay server")?;
    Ok(())
}
