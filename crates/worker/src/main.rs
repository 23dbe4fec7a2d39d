//! Vendera Billing Worker
//!
//! Handles scheduled billing jobs:
//! - Recurring billing sweep (daily at 00:10 UTC)
//! - Pending-cancellation expiry (daily at 00:40 UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use vendera_billing::BillingEngine;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

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

    info!("Starting Vendera Billing Worker");

    let pool = create_db_pool().await?;

    vendera_billing::run_migrations(&pool).await?;

    let engine = match BillingEngine::from_env(pool) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            // If the gateway isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing engine - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    #[allow(clippy::expect_used)] // Fail-fast: the sweep cannot run without its secret
    let sweep_secret = std::env::var("SWEEP_SECRET").expect("SWEEP_SECRET must be set");

    let scheduler = JobScheduler::new().await?;

    // Job 1: Recurring billing sweep (daily at 00:10 UTC)
    let sweep_engine = engine.clone();
    let sweep_secret_job = sweep_secret.clone();
    scheduler
        .add(Job::new_async("0 10 0 * * *", move |_uuid, _l| {
            let engine = sweep_engine.clone();
            let secret = sweep_secret_job.clone();
            Box::pin(async move {
                info!("Running recurring billing sweep");
                match engine
                    .sweep
                    .run_sweep(&secret, OffsetDateTime::now_utc())
                    .await
                {
                    Ok(summary) => {
                        info!(
                            processed = summary.processed,
                            successful = summary.successful,
                            failed = summary.failed,
                            "Recurring billing sweep finished"
                        );
                        for failure in &summary.errors {
                            error!(
                                subscription_id = %failure.subscription_id,
                                error = %failure.error,
                                "Subscription failed in sweep"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Recurring billing sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Recurring billing sweep (daily at 00:10 UTC)");

    // Job 2: Expire pending cancellations whose period has elapsed
    // (daily at 00:40 UTC, after the sweep)
    let expiry_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 40 0 * * *", move |_uuid, _l| {
            let engine = expiry_engine.clone();
            Box::pin(async move {
                info!("Running pending-cancellation expiry");
                match engine
                    .subscriptions
                    .expire_pending_cancellations(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(expired) => info!(expired = expired, "Pending-cancellation expiry finished"),
                    Err(e) => error!(error = %e, "Pending-cancellation expiry failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Pending-cancellation expiry (daily at 00:40 UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Vendera Billing Worker started successfully with 3 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
