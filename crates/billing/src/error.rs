//! Billing error types

use crate::gateway::GatewayError;

/// Errors produced by the billing engine
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// A referenced entity (subscription, vendor) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The plan id is not present in the injected catalog
    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    /// Caller-supplied input failed validation before any side effect
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The requested transition is not legal from the subscription's state
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The subscription is not eligible for the requested operation
    /// (e.g., reactivating a force-cancelled subscription)
    #[error("Not eligible: {0}")]
    NotEligible(String),

    /// The gateway reported a declined or failed charge
    #[error("Charge failed: {0}")]
    ChargeFailed(String),

    /// Transport-level gateway failure
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Two writers raced on the same subscription row; caller should retry
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Storage failure
    #[error("Database error: {0}")]
    Database(String),

    /// Webhook signature did not verify
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// The sweep shared secret did not match
    #[error("Unauthorized")]
    Unauthorized,

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

/// Result type for billing operations
pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    /// Classify a charge-path gateway error: declines are user-facing charge
    /// failures, everything else is a transport-level gateway error
    pub fn from_charge(e: GatewayError) -> Self {
        match e {
            GatewayError::Declined(reason) => BillingError::ChargeFailed(reason),
            other => BillingError::Gateway(other),
        }
    }

    /// Validation-class errors carry no side effects and map to 4xx at the API
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BillingError::NotFound(_)
                | BillingError::UnknownPlan(_)
                | BillingError::Validation(_)
                | BillingError::InvalidTransition(_)
                | BillingError::NotEligible(_)
        )
    }
}
