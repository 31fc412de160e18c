use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the UHI gateway
///
/// Loads `.env`, builds the gateway from `UHI_*` environment variables, starts the
/// deadline sweeper and serves the REST API (callbacks included) until Ctrl-C.
///
/// # Environment Variables
/// - `UHI_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `UHI_SUBSCRIBER_ID` / `UHI_SUBSCRIBER_URI`: this participant's identity (required)
/// - `UHI_SIGNING_KEY`: base64 ed25519 seed; an ephemeral key is used when unset
/// - `UHI_TRUSTED_KEYS_FILE`: YAML registry of counterparty public keys
/// - `UHI_API_KEYS`: `key=participant_id` pairs accepted on local endpoints
/// - `UHI_DATA_DIR`: storage root for consents and transactions (default: "uhi_data")
///
/// # Returns
/// * `Ok(())` - If the server starts and shuts down cleanly
/// * `Err(anyhow::Error)` - If configuration, binding or serving fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("uhi=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr: SocketAddr = std::env::var("UHI_REST_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3000".into())
        .parse()?;

    let state = api_rest::startup::state_from_env()?;
    tracing::info!(
        subscriber_id = %state.gateway.config().subscriber_id(),
        "++ Starting UHI gateway REST on {}",
        rest_addr
    );
    let sweeper = state.gateway.spawn_sweeper();

    let listener = tokio::net::TcpListener::bind(rest_addr).await?;
    let served = axum::serve(listener, api_rest::router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("-- Shutting down");
        })
        .await;
    sweeper.abort();
    served?;

    Ok(())
}
