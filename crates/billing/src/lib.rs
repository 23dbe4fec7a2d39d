// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Some lifecycle operations take many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Vendera Billing Engine
//!
//! Tracks a vendor's paid plan over time, computes money owed when plans
//! change mid-cycle, executes recurring charges on schedule, and reconciles
//! asynchronous payment-gateway events with the authoritative subscription
//! record.
//!
//! ## Components
//!
//! - **Plan Catalog**: injected, versioned tier/price/limit configuration
//! - **State Machine**: subscription status transitions and date invariants
//! - **Proration Calculator**: mid-cycle plan-change charges
//! - **Recurring Billing Sweep**: scheduled renewals with per-row isolation
//! - **Webhook Reconciler**: idempotent gateway event processing
//! - **Transaction Ledger**: append-only audit trail and idempotency store

pub mod catalog;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod lifecycle;
pub mod postgres;
pub mod proration;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod webhooks;


// Catalog
pub use catalog::{BillingInterval, PlanCatalog, PlanDefinition, PlanLimits};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    AttachOutcome, ChargeOutcome, ChargeRequest, ChargeStatus, CreateCustomerRequest,
    GatewayConfig, GatewayError, HttpGateway, PaymentGateway, PaymentMethodDetails,
};

// Ledger
pub use ledger::{billing_period_key, Transaction, TransactionStatus, TransactionType};

// Lifecycle
pub use lifecycle::{EnrollmentRequest, SubscriptionService};

// Postgres store
pub use postgres::{run_migrations, PgStore};

// Proration
pub use proration::proration_charge;

// Scheduler
pub use scheduler::{RecurringBillingService, SweepError, SweepSummary};

// Store
pub use store::{InMemoryStore, SubscriptionStore};

// Subscription
pub use subscription::{CancelReason, Subscription, SubscriptionState, Transition};

// Webhooks
pub use webhooks::{WebhookDisposition, WebhookEvent, WebhookHandler};

use std::sync::Arc;

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// ISO currency code for all charges
    pub currency: String,
    /// Shared secret protecting the recurring billing sweep
    pub sweep_secret: String,
    /// Secret for webhook signature verification
    pub webhook_secret: String,
}

/// Main billing engine combining all billing functionality
pub struct BillingEngine {
    pub catalog: Arc<PlanCatalog>,
    pub subscriptions: SubscriptionService,
    pub sweep: RecurringBillingService,
    pub webhooks: WebhookHandler,
}

impl BillingEngine {
    /// Create the engine from environment variables: gateway credentials,
    /// sweep secret, and an optional `PLAN_CATALOG_PATH` JSON document
    /// (falling back to the built-in tier set).
    pub fn from_env(pool: sqlx::PgPool) -> BillingResult<Self> {
        let gateway_config = GatewayConfig::from_env()?;
        let sweep_secret = std::env::var("SWEEP_SECRET")
            .map_err(|_| BillingError::Config("SWEEP_SECRET must be set".to_string()))?;

        let catalog = match std::env::var("PLAN_CATALOG_PATH") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    BillingError::Config(format!("Cannot read plan catalog '{}': {}", path, e))
                })?;
                PlanCatalog::from_json_str(&raw)?
            }
            Err(_) => PlanCatalog::default_tiers(),
        };

        let config = EngineConfig {
            currency: gateway_config.currency.clone(),
            sweep_secret,
            webhook_secret: gateway_config.webhook_secret.clone(),
        };
        let gateway = Arc::new(HttpGateway::new(gateway_config)?);
        let store = Arc::new(PgStore::new(pool));

        Ok(Self::new(catalog, store, gateway, config))
    }

    pub fn new(
        catalog: PlanCatalog,
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: EngineConfig,
    ) -> Self {
        let catalog = Arc::new(catalog);
        Self {
            subscriptions: SubscriptionService::new(
                store.clone(),
                gateway.clone(),
                catalog.clone(),
                config.currency.clone(),
            ),
            sweep: RecurringBillingService::new(
                store.clone(),
                gateway.clone(),
                catalog.clone(),
                config.currency.clone(),
                config.sweep_secret,
            ),
            webhooks: WebhookHandler::new(store, gateway, config.currency, config.webhook_secret),
            catalog,
        }
    }
}
