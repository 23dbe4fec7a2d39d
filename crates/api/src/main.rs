//! Vendera Billing API server

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::info;
use vendera_billing::BillingEngine;

use vendera_api::{routes, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Vendera Billing API");

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;
    info!("Database pool created");

    vendera_billing::run_migrations(&pool).await?;
    info!("Migrations applied");

    let engine = Arc::new(BillingEngine::from_env(pool)?);
    let state = AppState::new(engine, config.clone());

    let app = routes::router(state);
    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    info!(port = config.http_port, "Billing API listening");

    axum::serve(listener, app).await?;
    Ok(())
}
