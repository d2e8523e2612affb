use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod bus;
mod chat;
mod config;
mod entity;
mod error;
mod interface;
mod lifecycle;
mod registry;
mod relay;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = config::Config::from_env()?;
    info!("Support relay starting...");

    info!("Initializing store at {}", config.database_path.display());
    let store = store::Store::new(&config.database_path).await?;
    store.init().await?;

    let shutdown = CancellationToken::new();
    let (state, fan_out) = interface::AppState::new(store, &config, shutdown.clone());
    let app = interface::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Listening on {}", config.bind_address);

    let server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            // Live connections close with a shutdown reason via their child tokens.
            shutdown.cancel();
            match server.await {
                Ok(Err(e)) => error!("Server stopped with error: {}", e),
                Err(e) => error!("Server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        res = &mut server => {
            error!("Server stopped unexpectedly: {:?}", res);
            shutdown.cancel();
        }
    }

    if let Err(e) = fan_out.await {
        error!("Broadcaster task failed: {}", e);
    }

    info!("Support relay stopped");
    Ok(())
}
