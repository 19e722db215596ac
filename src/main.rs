use std::sync::Arc;
use tracing::info;

use comps_gateway::{routes, AppState, GatewayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GatewayConfig::from_env()?;

    info!("Starting comps gateway");
    info!("Search upstream: {}", config.upstream.search_url);
    if config.upstream.api_token.is_some() {
        info!("Searching with the static COMPS_API_TOKEN");
    } else if config.upstream.credentials().is_some() {
        info!("Searching with app tokens from {}", config.upstream.token_url);
    } else {
        info!("No search credentials configured, searching anonymously");
    }

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::from_config(config)?);
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Comps gateway listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
