use std::env;
use std::net::SocketAddr;
use std::path::Path;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use hearth::api::{AppState, router};
use hearth::config::Config;

/// Default configuration file path, overridable via `HEARTH_CONFIG`.
const DEFAULT_CONFIG_PATH: &str = "app_config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("hearth=info".parse()?))
        .init();

    let config_path =
        env::var("HEARTH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(Path::new(&config_path))?;
    info!(
        config = %config_path,
        ha_url = %config.home_assistant.url,
        "Starting Hearth"
    );

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port).parse()?;
    let state = AppState::new(config);

    // Startup probe only: a dead HA instance should not prevent serving
    // cached imports or the config endpoint.
    match state.ha.get_states().await {
        Ok(states) => info!(entities = states.len(), "Connected to Home Assistant"),
        Err(e) => warn!(error = %e, "Home Assistant is not reachable yet"),
    }

    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Hearth is listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
