//! Standalone REST API server binary.
//!
//! ## Purpose
//! Runs the gateway REST API on its own.
//!
//! ## Intended use
//! Useful for development and debugging. The workspace's main `uhi-run` binary serves the
//! same router and additionally loads `.env`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Starts the REST API on `UHI_REST_ADDR` (default `0.0.0.0:3000`).
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - the gateway configuration in the environment is invalid,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?)
                .add_directive("uhi=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("UHI_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    tracing::info!("-- Starting UHI REST API on {}", addr);

    let state = api_rest::startup::state_from_env()?;
    let sweeper = state.gateway.spawn_sweeper();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, api_rest::router(state)).await;
    sweeper.abort();
    served?;

    Ok(())
}
