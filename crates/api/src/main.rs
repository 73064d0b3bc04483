//! Teamzones API Server
//!
//! Serves the billing endpoints and accepts gateway webhooks.

use teamzones_api::{create_router, AppState, Config};
use teamzones_billing::BillingService;
use teamzones_shared::{create_pool, run_migrations};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,teamzones_api=debug,teamzones_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Teamzones API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        run_migrations(&pool).await?;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    let billing = BillingService::from_env(pool)?;
    tracing::info!("Billing service initialized");

    let app = create_router(AppState::new(billing));

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
